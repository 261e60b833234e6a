//! Bounded concurrency dispatcher.
//!
//! Runs one async task per input with at most `concurrency` outstanding.
//! With a concurrency of 1 inputs are processed strictly in order. The
//! first failing task stops new scheduling; tasks already running are
//! awaited to completion before that first error is returned. Nothing is
//! cancelled mid-flight and no per-task timeout is applied.

use std::future::Future;

use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};

#[derive(Debug, Clone, Copy)]
pub struct Dispatcher {
    concurrency: usize,
}

impl Dispatcher {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run `task` over `inputs`; returns the number of tasks that succeeded.
    pub async fn run<I, T, F, Fut>(&self, inputs: I, task: F) -> Result<usize>
    where
        I: IntoIterator<Item = T>,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut done = 0;
        if self.concurrency == 1 {
            for input in inputs {
                task(input).await?;
                done += 1;
            }
            return Ok(done);
        }

        let mut inputs = inputs.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut first_err = None;
        loop {
            while first_err.is_none() && in_flight.len() < self.concurrency {
                match inputs.next() {
                    Some(input) => in_flight.push(task(input)),
                    None => break,
                }
            }
            match in_flight.next().await {
                Some(Ok(())) => done += 1,
                Some(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                None => break,
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(done),
        }
    }
}
