//! Gateway pinning: remember the first (ip, mac) seen, refuse silent changes.
//!
//! A changed gateway with no duplicate MAC on the segment looks like a
//! hardware swap and is accepted after the operator confirms it. A duplicate
//! MAC means someone else is answering for the gateway, so the previously
//! trusted binding is restored without asking.

use crate::{
    error::{Error, Result},
    network::{GatewayRecord, NetworkInfo, NetworkProbe},
    operator::Operator,
    storage::GatewayStore,
};

use tracing::{error, info, warn};

/// Terminal state of the guard. Every variant names exactly one binding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardOutcome {
    /// No record existed; the live gateway was recorded.
    FirstRun(GatewayRecord),
    Matched(GatewayRecord),
    /// Operator confirmed a legitimate gateway replacement.
    ChangedAccepted {
        previous: GatewayRecord,
        current:  GatewayRecord,
    },
    /// Duplicate MAC seen; the stored binding was kept.
    ChangedRejected {
        trusted:  GatewayRecord,
        observed: GatewayRecord,
    },
}

impl GuardOutcome {
    /// The binding the static ARP entry must point at.
    pub fn binding(&self) -> &GatewayRecord {
        match self {
            GuardOutcome::FirstRun(r) | GuardOutcome::Matched(r) => r,
            GuardOutcome::ChangedAccepted { current, .. } => current,
            GuardOutcome::ChangedRejected { trusted, .. } => trusted,
        }
    }

    /// Record to write back, if the stored one is missing or superseded.
    pub fn record_to_persist(&self) -> Option<&GatewayRecord> {
        match self {
            GuardOutcome::FirstRun(r) => Some(r),
            GuardOutcome::ChangedAccepted { current, .. } => Some(current),
            _ => None,
        }
    }
}

/// Decides the binding. `duplicate_mac` runs only on a mismatch and
/// `confirm` only when no duplicate was found.
pub fn decide(
    stored: Option<&GatewayRecord>,
    live: &GatewayRecord,
    duplicate_mac: impl FnOnce() -> Result<bool>,
    confirm: impl FnOnce() -> Result<bool>,
) -> Result<GuardOutcome> {
    let stored = match stored {
        None => return Ok(GuardOutcome::FirstRun(live.clone())),
        Some(s) if s == live => return Ok(GuardOutcome::Matched(live.clone())),
        Some(s) => s,
    };

    warn!(
        "WARNING: Gateway address or mac has changed. {} => {} | {} => {}",
        stored.ip, live.ip, stored.mac, live.mac
    );

    if duplicate_mac()? {
        error!(
            "Duplicated MAC address exist. It may be an ARP spoofing attack, so proceeding with \
             the previous gateway {stored}. If the network does not work, check your connection."
        );
        return Ok(GuardOutcome::ChangedRejected {
            trusted:  stored.clone(),
            observed: live.clone(),
        });
    }

    info!("ARP attack is not detected");
    if confirm()? {
        info!(gateway = %live, "gateway record overwritten");
        Ok(GuardOutcome::ChangedAccepted {
            previous: stored.clone(),
            current:  live.clone(),
        })
    } else {
        error!("gateway overwrite aborted, check your gateway status manually");
        Err(Error::GatewayAmbiguity {
            stored:   stored.clone(),
            observed: live.clone(),
        })
    }
}

pub struct GatewayGuard<'a> {
    store:    GatewayStore,
    probe:    &'a dyn NetworkProbe,
    operator: &'a dyn Operator,
}

impl<'a> GatewayGuard<'a> {
    pub fn new(store: GatewayStore, probe: &'a dyn NetworkProbe, operator: &'a dyn Operator) -> Self {
        GatewayGuard { store, probe, operator }
    }

    /// Runs discovery, decides, persists if needed, then pins the binding in the ARP table.
    /// Nothing is written before the operator answers.
    pub fn run(&self) -> Result<(NetworkInfo, GuardOutcome)> {
        let info = self.probe.discover()?;
        let stored = self.store.load()?;

        let outcome = decide(
            stored.as_ref(),
            &info.gateway,
            || self.probe.duplicated_mac_exists(),
            || {
                self.operator
                    .confirm(
                        "Did you change your gateway device recently? \
                         If so, the previous record (ip, mac) is overwritten.",
                    )
                    .map_err(Error::from)
            },
        )?;

        if let Some(record) = outcome.record_to_persist() {
            self.store.save(record)?;
        }
        self.probe.set_arp_static(&info, outcome.binding())?;

        Ok((info, outcome))
    }
}
