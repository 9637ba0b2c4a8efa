//! Outbound address discovery, per-marketplace liveness probing and round-robin selection.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::marketplace::Marketplace;
use crate::transport::fetch::Fetcher;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeResult {
    pub working: bool,
    pub status: Option<u16>,
    pub bytes: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundAddress {
    pub address: Ipv4Addr,
    pub results: BTreeMap<Marketplace, ProbeResult>,
    pub last_tested_at: Option<DateTime<Utc>>,
}

/// Working addresses for one marketplace plus its rotation cursor.
#[derive(Debug, Clone, Default)]
pub struct AddressAssignment {
    pub addresses: Vec<Ipv4Addr>,
    cursor: usize,
    requests: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RotationStats {
    pub cursor: usize,
    pub working: usize,
    pub requests: u64,
}

#[derive(Debug, Clone)]
pub struct AddressPool {
    probe_timeout: Duration,
    overrides: Option<Vec<Ipv4Addr>>,
    addresses: Vec<OutboundAddress>,
    assignments: HashMap<Marketplace, AddressAssignment>,
}

/// Extracts usable IPv4 addresses from `hostname -I` style output, keeping first-seen order.
pub fn parse_host_addresses(raw: &str) -> Vec<Ipv4Addr> {
    let mut seen = HashSet::new();
    raw.split(|c: char| c.is_whitespace() || c == ',')
        .filter_map(|tok| tok.trim().parse::<Ipv4Addr>().ok())
        .filter(|a| !a.is_loopback() && !a.is_unspecified())
        .filter(|a| seen.insert(*a))
        .collect()
}

impl AddressPool {
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            probe_timeout,
            overrides: None,
            addresses: Vec::new(),
            assignments: HashMap::new(),
        }
    }

    /// Skip OS enumeration and probe exactly these addresses.
    pub fn with_candidates(mut self, candidates: Vec<Ipv4Addr>) -> Self {
        self.overrides = Some(candidates);
        self
    }

    /// Seeds a marketplace's working list directly, bypassing probing.
    pub fn with_working(mut self, marketplace: Marketplace, addresses: Vec<Ipv4Addr>) -> Self {
        self.assignments.insert(
            marketplace,
            AddressAssignment {
                addresses,
                ..Default::default()
            },
        );
        self
    }

    pub async fn discover(&self) -> Result<Vec<Ipv4Addr>> {
        if let Some(list) = &self.overrides {
            return Ok(list.clone());
        }
        let out = Command::new("hostname")
            .arg("-I")
            .output()
            .await
            .context("failed to run `hostname -I`")?;
        if !out.status.success() {
            warn!(status = ?out.status, "hostname -I exited non-zero; no outbound addresses discovered");
            return Ok(Vec::new());
        }
        let found = parse_host_addresses(&String::from_utf8_lossy(&out.stdout));
        debug!(count = found.len(), addresses = ?found, "discovered local addresses");
        Ok(found)
    }

    pub async fn test<F: Fetcher + ?Sized>(
        &self,
        fetcher: &F,
        address: Ipv4Addr,
        marketplace: Marketplace,
    ) -> ProbeResult {
        let profile = marketplace.profile();
        match fetcher
            .get(profile.probe_url, Some(address), self.probe_timeout)
            .await
        {
            Ok(resp) => {
                let bytes = resp.body.len();
                let working = resp.status == 200 && bytes > profile.min_probe_bytes;
                ProbeResult {
                    working,
                    status: Some(resp.status),
                    bytes,
                    error: (!working).then(|| format!("status {} with {} bytes", resp.status, bytes)),
                }
            }
            Err(e) => ProbeResult {
                working: false,
                status: None,
                bytes: 0,
                error: Some(e.to_string()),
            },
        }
    }

    /// Probes every discovered address against every marketplace and rebuilds the working
    /// lists. Safe to call again; cursors start over.
    pub async fn initialize<F: Fetcher + ?Sized>(
        &mut self,
        fetcher: &F,
    ) -> Result<BTreeMap<Marketplace, Vec<Ipv4Addr>>> {
        let candidates = self.discover().await?;
        info!(count = candidates.len(), "probing outbound addresses");

        let this: &Self = self;
        let probes = candidates.iter().map(|&addr| async move {
            let mut results = BTreeMap::new();
            for mp in Marketplace::ALL {
                results.insert(mp, this.test(fetcher, addr, mp).await);
            }
            OutboundAddress {
                address: addr,
                results,
                last_tested_at: Some(Utc::now()),
            }
        });
        let tested = join_all(probes).await;

        let mut mapping = BTreeMap::new();
        for mp in Marketplace::ALL {
            let working: Vec<Ipv4Addr> = tested
                .iter()
                .filter(|o| o.results.get(&mp).map(|r| r.working).unwrap_or(false))
                .map(|o| o.address)
                .collect();
            if working.is_empty() {
                warn!(marketplace = %mp, "no working outbound address");
            } else {
                info!(marketplace = %mp, working = ?working, "outbound addresses ready");
            }
            mapping.insert(mp, working);
        }

        self.addresses = tested;
        self.assignments = mapping
            .iter()
            .map(|(mp, list)| {
                (
                    *mp,
                    AddressAssignment {
                        addresses: list.clone(),
                        ..Default::default()
                    },
                )
            })
            .collect();
        Ok(mapping)
    }

    /// Round robin over the working list minus `exclude`.
    pub fn next(&mut self, marketplace: Marketplace, exclude: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
        let slot = self.assignments.get_mut(&marketplace)?;
        let candidates: Vec<Ipv4Addr> = slot
            .addresses
            .iter()
            .copied()
            .filter(|a| !exclude.contains(a))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        if slot.cursor >= candidates.len() {
            slot.cursor = 0;
        }
        let picked = candidates[slot.cursor];
        slot.cursor = (slot.cursor + 1) % candidates.len();
        slot.requests += 1;
        Some(picked)
    }

    /// First working address not in `exclude`; used when rotation is off.
    pub fn first(&self, marketplace: Marketplace, exclude: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
        self.assignments
            .get(&marketplace)?
            .addresses
            .iter()
            .copied()
            .find(|a| !exclude.contains(a))
    }

    pub fn working(&self, marketplace: Marketplace) -> &[Ipv4Addr] {
        self.assignments
            .get(&marketplace)
            .map(|s| s.addresses.as_slice())
            .unwrap_or(&[])
    }

    pub fn has_working(&self, marketplace: Marketplace) -> bool {
        !self.working(marketplace).is_empty()
    }

    pub fn reset_rotation(&mut self, marketplace: Option<Marketplace>) {
        for (mp, slot) in self.assignments.iter_mut() {
            if marketplace.map_or(true, |m| m == *mp) {
                slot.cursor = 0;
                slot.requests = 0;
            }
        }
    }

    pub fn rotation_stats(&self) -> BTreeMap<Marketplace, RotationStats> {
        self.assignments
            .iter()
            .map(|(mp, s)| {
                (
                    *mp,
                    RotationStats {
                        cursor: s.cursor,
                        working: s.addresses.len(),
                        requests: s.requests,
                    },
                )
            })
            .collect()
    }

    /// Probe results from the last `initialize`.
    pub fn tested(&self) -> &[OutboundAddress] {
        &self.addresses
    }

    /// (working, tested) per marketplace.
    pub fn summary(&self) -> BTreeMap<Marketplace, (usize, usize)> {
        Marketplace::ALL
            .iter()
            .map(|mp| (*mp, (self.working(*mp).len(), self.addresses.len())))
            .collect()
    }
}
