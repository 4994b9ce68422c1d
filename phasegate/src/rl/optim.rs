// src/rl/optim.rs
//
// Adam optimiser over `QNetwork` parameters.

use crate::policy::qnet::{Gradients, QNetwork};

#[derive(Debug, Clone)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    t: u64,
    m: Gradients,
    v: Gradients,
}

impl Adam {
    pub fn new(net: &QNetwork, lr: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: Gradients::zeros_like(net),
            v: Gradients::zeros_like(net),
        }
    }

    pub fn steps(&self) -> u64 {
        self.t
    }

    /// Apply one descent step along `grads`.
    pub fn step(&mut self, net: &mut QNetwork, grads: &Gradients) {
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t.min(i32::MAX as u64) as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t.min(i32::MAX as u64) as i32);
        let hp = Hyper {
            lr: self.lr,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            bc1,
            bc2,
        };
        for (l, (w, b)) in net.params_mut().enumerate() {
            let (gw, gb) = &grads.layers[l];
            let (mw, mb) = &mut self.m.layers[l];
            let (vw, vb) = &mut self.v.layers[l];
            adam_update(&hp, w, gw, mw, vw);
            adam_update(&hp, b, gb, mb, vb);
        }
    }
}

struct Hyper {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    bc1: f64,
    bc2: f64,
}

fn adam_update(hp: &Hyper, p: &mut [f64], g: &[f64], m: &mut [f64], v: &mut [f64]) {
    for i in 0..p.len() {
        m[i] = hp.beta1 * m[i] + (1.0 - hp.beta1) * g[i];
        v[i] = hp.beta2 * v[i] + (1.0 - hp.beta2) * g[i] * g[i];
        let m_hat = m[i] / hp.bc1;
        let v_hat = v[i] / hp.bc2;
        p[i] -= hp.lr * m_hat / (v_hat.sqrt() + hp.eps);
    }
}
