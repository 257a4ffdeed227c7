// src/pipeline/delay.rs
// Politeness delay before every request. With randomization on, each wait is
// drawn uniformly from [0.5 * delay, 1.5 * delay).

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use super::RequestInterceptor;
use crate::request::Request;

pub struct Delay {
    delay: Duration,
    randomize: bool,
}

impl Delay {
    pub fn new(delay: Duration, randomize: bool) -> Self {
        Self { delay, randomize }
    }

    pub fn next_wait(&self) -> Duration {
        if self.randomize && !self.delay.is_zero() {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            self.delay.mul_f64(factor)
        } else {
            self.delay
        }
    }
}

#[async_trait]
impl RequestInterceptor for Delay {
    async fn process(&self, _req: &mut Request) {
        let wait = self.next_wait();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}
