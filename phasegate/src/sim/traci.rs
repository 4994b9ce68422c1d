// src/sim/traci.rs
//
// TraCI binary protocol: framing, typed values and a blocking connection.
//
// Message layout: a big-endian u32 total length (including itself), then a
// sequence of commands. A command is `[len u8][id u8][payload]`, or the
// extended form `[0u8][len u32][id u8][payload]` when the length does not
// fit in one byte. Every request command is answered by a status command
// `[len][id][result u8][description string]`; variable queries are then
// followed by a response command with id `request + 0x10`.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use tracing::debug;

use crate::error::SimError;

pub mod cmd {
    pub const GET_VERSION: u8 = 0x00;
    pub const SIMSTEP: u8 = 0x02;
    pub const CLOSE: u8 = 0x7F;
    pub const GET_TL_VARIABLE: u8 = 0xa2;
    pub const GET_EDGE_VARIABLE: u8 = 0xaa;
    pub const GET_SIM_VARIABLE: u8 = 0xab;
    pub const GET_LANEAREA_VARIABLE: u8 = 0xad;
    pub const SET_TL_VARIABLE: u8 = 0xc2;
    /// Added to a get command id to form its response id.
    pub const RESPONSE_OFFSET: u8 = 0x10;
}

pub mod var {
    pub const ID_LIST: u8 = 0x00;
    pub const LAST_STEP_VEHICLE_NUMBER: u8 = 0x10;
    pub const LAST_STEP_MEAN_SPEED: u8 = 0x11;
    pub const TL_PHASE_INDEX: u8 = 0x22;
    pub const TL_CURRENT_PHASE: u8 = 0x28;
    pub const PMX_EMISSION: u8 = 0x65;
    pub const TIME: u8 = 0x66;
    pub const ARRIVED_VEHICLES_IDS: u8 = 0x7a;
    pub const MIN_EXPECTED_VEHICLES: u8 = 0x7d;
}

pub mod tag {
    pub const UBYTE: u8 = 0x07;
    pub const INTEGER: u8 = 0x09;
    pub const DOUBLE: u8 = 0x0B;
    pub const STRING: u8 = 0x0C;
    pub const STRING_LIST: u8 = 0x0E;
    pub const COMPOUND: u8 = 0x0F;
}

pub const RTYPE_OK: u8 = 0x00;
pub const RTYPE_NOT_IMPLEMENTED: u8 = 0x01;
pub const RTYPE_ERR: u8 = 0xFF;

/// A typed TraCI value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    UByte(u8),
    Int(i32),
    Double(f64),
    Str(String),
    StrList(Vec<String>),
    Compound(Vec<Value>),
}

impl Value {
    pub fn type_tag(&self) -> u8 {
        match self {
            Value::UByte(_) => tag::UBYTE,
            Value::Int(_) => tag::INTEGER,
            Value::Double(_) => tag::DOUBLE,
            Value::Str(_) => tag::STRING,
            Value::StrList(_) => tag::STRING_LIST,
            Value::Compound(_) => tag::COMPOUND,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::UByte(v) => Some(*v as f64),
            Value::Int(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::UByte(v) => Some(*v as i64),
            Value::Int(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn into_string_list(self) -> Option<Vec<String>> {
        match self {
            Value::StrList(v) => Some(v),
            _ => None,
        }
    }
}

/// Append-only encoder.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_f64(&mut self, v: f64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_str(&mut self, v: &str) -> &mut Self {
        self.put_i32(v.len() as i32);
        self.buf.extend_from_slice(v.as_bytes());
        self
    }

    pub fn put_str_list(&mut self, v: &[String]) -> &mut Self {
        self.put_i32(v.len() as i32);
        for s in v {
            self.put_str(s);
        }
        self
    }

    /// Write the type tag followed by the value.
    pub fn put_value(&mut self, v: &Value) -> &mut Self {
        self.put_u8(v.type_tag());
        match v {
            Value::UByte(x) => self.put_u8(*x),
            Value::Int(x) => self.put_i32(*x),
            Value::Double(x) => self.put_f64(*x),
            Value::Str(x) => self.put_str(x),
            Value::StrList(x) => self.put_str_list(x),
            Value::Compound(items) => {
                self.put_i32(items.len() as i32);
                for item in items {
                    self.put_value(item);
                }
                self
            }
        }
    }

    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a received buffer.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SimError> {
        if self.remaining() < n {
            return Err(SimError::Protocol(format!(
                "truncated message: wanted {n} bytes, {} left",
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], SimError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, SimError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i32(&mut self) -> Result<i32, SimError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, SimError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, SimError> {
        Ok(f64::from_be_bytes(self.take_array()?))
    }

    pub fn read_str(&mut self) -> Result<String, SimError> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(SimError::Protocol(format!("negative string length {len}")));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| SimError::Protocol(format!("string is not utf-8: {err}")))
    }

    pub fn read_str_list(&mut self) -> Result<Vec<String>, SimError> {
        let count = self.read_i32()?;
        if count < 0 {
            return Err(SimError::Protocol(format!("negative list length {count}")));
        }
        (0..count).map(|_| self.read_str()).collect()
    }

    /// Read a value whose type tag has already been consumed.
    pub fn read_value(&mut self, type_tag: u8) -> Result<Value, SimError> {
        match type_tag {
            tag::UBYTE => Ok(Value::UByte(self.read_u8()?)),
            tag::INTEGER => Ok(Value::Int(self.read_i32()?)),
            tag::DOUBLE => Ok(Value::Double(self.read_f64()?)),
            tag::STRING => Ok(Value::Str(self.read_str()?)),
            tag::STRING_LIST => Ok(Value::StrList(self.read_str_list()?)),
            tag::COMPOUND => {
                let count = self.read_i32()?;
                let mut items = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    let t = self.read_u8()?;
                    items.push(self.read_value(t)?);
                }
                Ok(Value::Compound(items))
            }
            other => Err(SimError::Protocol(format!(
                "unsupported type tag 0x{other:02x}"
            ))),
        }
    }

    pub fn read_tagged_value(&mut self) -> Result<Value, SimError> {
        let t = self.read_u8()?;
        self.read_value(t)
    }

    /// Split off one command, returning its id and a reader over its body.
    pub fn read_command(&mut self) -> Result<(u8, Reader<'a>), SimError> {
        let short = self.read_u8()? as usize;
        let body_len = if short == 0 {
            let ext = self.read_u32()? as usize;
            ext.checked_sub(6)
        } else {
            short.checked_sub(2)
        }
        .ok_or_else(|| SimError::Protocol("command length too small".to_string()))?;
        let id = self.read_u8()?;
        let body = self.take(body_len)?;
        Ok((id, Reader::new(body)))
    }
}

/// Frame one command, choosing the extended length form when needed.
pub fn frame_command(id: u8, payload: &[u8]) -> Vec<u8> {
    let short_len = 1 + 1 + payload.len();
    let mut w = Writer::new();
    if short_len <= u8::MAX as usize {
        w.put_u8(short_len as u8);
    } else {
        w.put_u8(0).put_u32((short_len + 4) as u32);
    }
    w.put_u8(id).put_bytes(payload);
    w.into_bytes()
}

/// Prefix concatenated commands with the total message length.
pub fn frame_message(commands: &[u8]) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u32((commands.len() + 4) as u32).put_bytes(commands);
    w.into_bytes()
}

/// Outcome of one request command.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub command: u8,
    pub result: u8,
    pub description: String,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        self.result == RTYPE_OK
    }
}

/// Parse the status command that opens every response message.
pub fn read_status(reader: &mut Reader<'_>) -> Result<Status, SimError> {
    let (command, mut body) = reader.read_command()?;
    let result = body.read_u8()?;
    let description = body.read_str()?;
    Ok(Status {
        command,
        result,
        description,
    })
}

/// Blocking TraCI client connection.
#[derive(Debug)]
pub struct TraciConnection {
    stream: TcpStream,
}

impl TraciConnection {
    /// Connect, retrying while the simulator is still starting up.
    pub fn connect(
        host: &str,
        port: u16,
        attempts: u32,
        backoff: Duration,
    ) -> Result<Self, SimError> {
        let attempts = attempts.max(1);
        let mut last_err = String::new();
        for attempt in 1..=attempts {
            match TcpStream::connect((host, port)) {
                Ok(stream) => return Self::from_stream(stream),
                Err(err) => {
                    last_err = err.to_string();
                    debug!(host, port, attempt, error = %err, "simulator not listening yet");
                    if attempt < attempts {
                        std::thread::sleep(backoff);
                    }
                }
            }
        }
        Err(SimError::NotListening(format!(
            "{host}:{port} after {attempts} attempts: {last_err}"
        )))
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self, SimError> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Duration::from_secs(60)))?;
        Ok(Self { stream })
    }

    fn send(&mut self, id: u8, payload: &[u8]) -> Result<(), SimError> {
        let message = frame_message(&frame_command(id, payload));
        self.stream.write_all(&message)?;
        Ok(())
    }

    fn recv(&mut self) -> Result<Vec<u8>, SimError> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf)?;
        let total = u32::from_be_bytes(len_buf) as usize;
        let body_len = total
            .checked_sub(4)
            .ok_or_else(|| SimError::Protocol(format!("message length {total} < 4")))?;
        let mut body = vec![0u8; body_len];
        self.stream.read_exact(&mut body)?;
        Ok(body)
    }

    /// Send one command and return whatever follows its OK status.
    pub fn exchange(&mut self, id: u8, payload: &[u8]) -> Result<Vec<u8>, SimError> {
        self.send(id, payload)?;
        let body = self.recv()?;
        let mut reader = Reader::new(&body);
        let status = read_status(&mut reader)?;
        if status.command != id {
            return Err(SimError::Protocol(format!(
                "status for command 0x{:02x}, expected 0x{id:02x}",
                status.command
            )));
        }
        match status.result {
            RTYPE_OK => Ok(reader.rest().to_vec()),
            RTYPE_NOT_IMPLEMENTED => Err(SimError::Protocol(format!(
                "command 0x{id:02x} not implemented: {}",
                status.description
            ))),
            _ => Err(SimError::Protocol(format!(
                "command 0x{id:02x} failed: {}",
                status.description
            ))),
        }
    }

    /// Returns `(api_version, simulator_identifier)`.
    pub fn get_version(&mut self) -> Result<(i32, String), SimError> {
        let rest = self.exchange(cmd::GET_VERSION, &[])?;
        let mut reader = Reader::new(&rest);
        let (id, mut body) = reader.read_command()?;
        if id != cmd::GET_VERSION {
            return Err(SimError::Protocol(format!(
                "unexpected version response id 0x{id:02x}"
            )));
        }
        let api = body.read_i32()?;
        let ident = body.read_str()?;
        Ok((api, ident))
    }

    /// Advance to `target_time`; 0.0 means exactly one step.
    pub fn simulation_step(&mut self, target_time: f64) -> Result<(), SimError> {
        let mut w = Writer::new();
        w.put_f64(target_time);
        let rest = self.exchange(cmd::SIMSTEP, w.as_bytes())?;
        if rest.len() >= 4 {
            let mut reader = Reader::new(&rest);
            let subscriptions = reader.read_i32()?;
            if subscriptions > 0 {
                debug!(subscriptions, "ignoring subscription results in step response");
            }
        }
        Ok(())
    }

    pub fn get_var(&mut self, domain: u8, variable: u8, object_id: &str) -> Result<Value, SimError> {
        let mut w = Writer::new();
        w.put_u8(variable).put_str(object_id);
        let rest = self.exchange(domain, w.as_bytes())?;
        let mut reader = Reader::new(&rest);
        let (id, mut body) = reader.read_command()?;
        if id != domain.wrapping_add(cmd::RESPONSE_OFFSET) {
            return Err(SimError::Protocol(format!(
                "response id 0x{id:02x} does not answer 0x{domain:02x}"
            )));
        }
        let got_var = body.read_u8()?;
        let got_obj = body.read_str()?;
        if got_var != variable || got_obj != object_id {
            return Err(SimError::Protocol(format!(
                "response for 0x{got_var:02x}/{got_obj}, asked 0x{variable:02x}/{object_id}"
            )));
        }
        body.read_tagged_value()
    }

    pub fn set_var(
        &mut self,
        domain: u8,
        variable: u8,
        object_id: &str,
        value: &Value,
    ) -> Result<(), SimError> {
        let mut w = Writer::new();
        w.put_u8(variable).put_str(object_id).put_value(value);
        self.exchange(domain, w.as_bytes())?;
        Ok(())
    }

    pub fn close(mut self) -> Result<(), SimError> {
        let result = self.exchange(cmd::CLOSE, &[]);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_extended_command_framing() {
        let short = frame_command(cmd::SIMSTEP, &[1, 2, 3]);
        assert_eq!(short, vec![5, cmd::SIMSTEP, 1, 2, 3]);

        let payload = vec![0xAA; 300];
        let long = frame_command(cmd::SET_TL_VARIABLE, &payload);
        assert_eq!(long[0], 0);
        assert_eq!(u32::from_be_bytes([long[1], long[2], long[3], long[4]]), 306);
        assert_eq!(long[5], cmd::SET_TL_VARIABLE);
        assert_eq!(long.len(), 306);

        let mut reader = Reader::new(&long);
        let (id, body) = reader.read_command().expect("extended command");
        assert_eq!(id, cmd::SET_TL_VARIABLE);
        assert_eq!(body.remaining(), 300);
    }

    #[test]
    fn message_length_includes_header() {
        let msg = frame_message(&frame_command(cmd::CLOSE, &[]));
        assert_eq!(&msg[..4], &6u32.to_be_bytes());
        assert_eq!(msg.len(), 6);
    }

    #[test]
    fn status_and_get_response_decode() {
        let mut status_body = Writer::new();
        status_body.put_u8(RTYPE_OK).put_str("");
        let mut resp_body = Writer::new();
        resp_body
            .put_u8(var::LAST_STEP_VEHICLE_NUMBER)
            .put_str("det_ns")
            .put_value(&Value::Int(7));

        let mut all = frame_command(cmd::GET_LANEAREA_VARIABLE, status_body.as_bytes());
        all.extend(frame_command(
            cmd::GET_LANEAREA_VARIABLE + cmd::RESPONSE_OFFSET,
            resp_body.as_bytes(),
        ));

        let mut reader = Reader::new(&all);
        let status = read_status(&mut reader).expect("status");
        assert!(status.is_ok());
        let (id, mut body) = reader.read_command().expect("response");
        assert_eq!(id, 0xbd);
        assert_eq!(body.read_u8().expect("var"), var::LAST_STEP_VEHICLE_NUMBER);
        assert_eq!(body.read_str().expect("obj"), "det_ns");
        assert_eq!(body.read_tagged_value().expect("value"), Value::Int(7));
    }

    #[test]
    fn truncated_buffer_is_protocol_error() {
        let mut reader = Reader::new(&[0, 0]);
        assert!(matches!(reader.read_i32(), Err(SimError::Protocol(_))));
    }

    #[test]
    fn compound_values_nest() {
        let v = Value::Compound(vec![Value::Int(1), Value::StrList(vec!["a".into()])]);
        let mut w = Writer::new();
        w.put_value(&v);
        let bytes = w.into_bytes();
        let mut reader = Reader::new(&bytes);
        assert_eq!(reader.read_tagged_value().expect("compound"), v);
    }
}
