//! The deploy-and-interact sequence.
//!
//! Steps run strictly in order and the first failure aborts the rest:
//! instantiate, read, then for every configured value write, confirm and
//! read again.

use std::fmt;

use num_bigint::BigUint;
use tracing::info;

use crate::{
    contracts::StoredValue,
    host::{Confirmation, Deployment, Host, HostError},
};

/// Value written when none is configured.
pub const DEFAULT_VALUE: u64 = 50;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverConfig {
    pub values: Vec<BigUint>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            values: vec![BigUint::from(DEFAULT_VALUE)],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Instantiate,
    InitialRead,
    Write,
    Confirm,
    Reread,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Instantiate => "instantiate",
            Step::InitialRead => "initial read",
            Step::Write => "write",
            Step::Confirm => "confirmation",
            Step::Reread => "read after write",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("{step} failed: {source}")]
    Step {
        step: Step,
        #[source]
        source: HostError,
    },
    #[error("no values configured to write")]
    NoValues,
}

impl DriverError {
    pub fn step(&self) -> Option<Step> {
        match self {
            DriverError::Step { step, .. } => Some(*step),
            DriverError::NoValues => None,
        }
    }

    pub fn host_error(&self) -> Option<&HostError> {
        match self {
            DriverError::Step { source, .. } => Some(source),
            DriverError::NoValues => None,
        }
    }
}

fn at(step: Step) -> impl FnOnce(HostError) -> DriverError {
    move |source| DriverError::Step { step, source }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteOutcome {
    pub written: StoredValue,
    pub confirmation: Confirmation,
    pub observed: StoredValue,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverReport {
    pub deployment: Deployment,
    pub initial: StoredValue,
    pub writes: Vec<WriteOutcome>,
}

impl DriverReport {
    pub fn final_value(&self) -> &StoredValue {
        self.writes
            .last()
            .map_or(&self.initial, |outcome| &outcome.observed)
    }

    /// True when the counter started at zero and every read after a
    /// confirmed write returned the written value.
    pub fn is_consistent(&self) -> bool {
        self.initial.is_zero()
            && self
                .writes
                .iter()
                .all(|outcome| outcome.observed == outcome.written)
    }
}

impl fmt::Display for DriverReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "SimpleStorage deployed to {} (block {})",
            self.deployment.address, self.deployment.block_height
        )?;
        write!(f, "Current value: {}", self.initial)?;
        for outcome in &self.writes {
            write!(
                f,
                "\nUpdated value: {} (tx {}, block {})",
                outcome.observed, outcome.confirmation.tx_hash, outcome.confirmation.block_height
            )?;
        }
        Ok(())
    }
}

pub async fn run<H>(host: &H, config: &DriverConfig) -> Result<DriverReport, DriverError>
where
    H: Host + ?Sized,
{
    if config.values.is_empty() {
        return Err(DriverError::NoValues);
    }

    let deployment = host.instantiate().await.map_err(at(Step::Instantiate))?;
    info!(address = %deployment.address, block = deployment.block_height, "counter instantiated");

    let initial = host
        .read(&deployment.address)
        .await
        .map_err(at(Step::InitialRead))?;
    info!(value = %initial, "current value");

    let mut writes = Vec::with_capacity(config.values.len());
    for value in &config.values {
        let pending = host
            .write(&deployment.address, value.clone())
            .await
            .map_err(at(Step::Write))?;
        info!(tx = %pending.tx_hash, value = %pending.value, "write submitted");
        let written = pending.value.clone();

        let confirmation = host
            .await_confirmation(pending)
            .await
            .map_err(at(Step::Confirm))?;
        info!(tx = %confirmation.tx_hash, block = confirmation.block_height, "write confirmed");

        let observed = host
            .read(&deployment.address)
            .await
            .map_err(at(Step::Reread))?;
        info!(value = %observed, "updated value");

        writes.push(WriteOutcome {
            written,
            confirmation,
            observed,
        });
    }

    Ok(DriverReport {
        deployment,
        initial,
        writes,
    })
}
