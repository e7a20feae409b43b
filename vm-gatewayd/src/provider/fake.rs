//! Scripted provider for tests. Counts calls, can fail zones, and can hold
//! zone listings until released.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use shared::types::MachineDetails;
use tokio::sync::{mpsc, watch};
use super::{MachineSummary, ProviderError, VmOperation, VmProvider};

#[derive(Default)]
struct Script {
    zones: Vec<String>,
    zones_fail: bool,
    machines: BTreeMap<String, Vec<String>>,
    failing: HashSet<String>,
    delay: Duration,
    calls_by_zone: HashMap<String, usize>,
    executed: Vec<(VmOperation, String, String)>,
    execute_fails: bool,
}

pub struct FakeProvider {
    script: Mutex<Script>,
    pub zone_list_calls: AtomicUsize,
    pub machine_list_calls: AtomicUsize,
    held: watch::Sender<Hold>,
}

#[derive(Default)]
struct Hold {
    all: bool,
    zones: HashSet<String>,
}

impl Hold {
    fn blocks(&self, zone: &str) -> bool {
        self.all || self.zones.contains(zone)
    }
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProvider {
    pub fn new() -> Self {
        let (held, _) = watch::channel(Hold::default());
        Self {
            script: Mutex::new(Script::default()),
            zone_list_calls: AtomicUsize::new(0),
            machine_list_calls: AtomicUsize::new(0),
            held,
        }
    }

    /// Add a zone and the machines it holds
    pub fn with_zone(self, zone: &str, machines: &[&str]) -> Self {
        self.set_machines(zone, machines);
        self
    }

    pub fn set_machines(&self, zone: &str, machines: &[&str]) {
        let mut s = self.script.lock().unwrap();
        if !s.zones.iter().any(|z| z == zone) {
            s.zones.push(zone.to_string());
        }
        s.machines
            .insert(zone.to_string(), machines.iter().map(|m| m.to_string()).collect());
    }

    pub fn fail_zone(&self, zone: &str) {
        self.script.lock().unwrap().failing.insert(zone.to_string());
    }

    pub fn heal_zone(&self, zone: &str) {
        self.script.lock().unwrap().failing.remove(zone);
    }

    pub fn fail_zone_listing(&self, fail: bool) {
        self.script.lock().unwrap().zones_fail = fail;
    }

    pub fn fail_execute(&self, fail: bool) {
        self.script.lock().unwrap().execute_fails = fail;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.script.lock().unwrap().delay = delay;
    }

    /// Hold every machine listing until `resume` is called
    pub fn pause(&self) {
        self.held.send_modify(|h| h.all = true);
    }

    pub fn resume(&self) {
        self.held.send_modify(|h| h.all = false);
    }

    /// Hold listings of one zone until `release_zone` is called
    pub fn hold_zone(&self, zone: &str) {
        self.held.send_modify(|h| {
            h.zones.insert(zone.to_string());
        });
    }

    pub fn release_zone(&self, zone: &str) {
        self.held.send_modify(|h| {
            h.zones.remove(zone);
        });
    }

    pub fn calls_for(&self, zone: &str) -> usize {
        self.script
            .lock()
            .unwrap()
            .calls_by_zone
            .get(zone)
            .copied()
            .unwrap_or(0)
    }

    pub fn machine_calls(&self) -> usize {
        self.machine_list_calls.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` machine listings have started
    pub async fn wait_for_calls(&self, n: usize) {
        while self.machine_calls() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    pub fn executed(&self) -> Vec<(VmOperation, String, String)> {
        self.script.lock().unwrap().executed.clone()
    }

    fn zone_of(&self, name: &str) -> Option<String> {
        let s = self.script.lock().unwrap();
        s.machines
            .iter()
            .find(|(_, names)| names.iter().any(|n| n == name))
            .map(|(zone, _)| zone.clone())
    }
}

fn failed(command: &str, stderr: &str) -> ProviderError {
    ProviderError::CommandFailed {
        command: command.to_string(),
        code: Some(1),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl VmProvider for FakeProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn list_zones(&self) -> Result<Vec<String>, ProviderError> {
        self.zone_list_calls.fetch_add(1, Ordering::SeqCst);
        let s = self.script.lock().unwrap();
        if s.zones_fail {
            return Err(failed("zones list", "ERROR: permission denied"));
        }
        Ok(s.zones.clone())
    }

    async fn list_machines_in_zone(&self, zone: &str) -> Result<Vec<MachineSummary>, ProviderError> {
        self.machine_list_calls.fetch_add(1, Ordering::SeqCst);

        let mut held = self.held.subscribe();
        let _ = held.wait_for(|h| !h.blocks(zone)).await;

        let delay = {
            let mut s = self.script.lock().unwrap();
            *s.calls_by_zone.entry(zone.to_string()).or_default() += 1;
            s.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let s = self.script.lock().unwrap();
        if s.failing.contains(zone) {
            return Err(failed("instances list", "ERROR: backend error"));
        }
        Ok(s.machines
            .get(zone)
            .map(|names| {
                names
                    .iter()
                    .map(|name| MachineSummary {
                        name: name.clone(),
                        zone: zone.to_string(),
                        status: "RUNNING".to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn describe(&self, name: &str, zone: &str) -> Result<MachineDetails, ProviderError> {
        match self.zone_of(name) {
            Some(found) if found == zone => Ok(MachineDetails {
                name: name.to_string(),
                status: "RUNNING".to_string(),
                zone: zone.to_string(),
                machine_type: "e2-standard-4".to_string(),
                network_ip: "10.0.0.7".to_string(),
            }),
            _ => Err(failed(
                "instances describe",
                &format!(
                    "ERROR: (gcloud.compute.instances.describe) Could not fetch resource:\n - The resource 'projects/lab/zones/{zone}/instances/{name}' was not found"
                ),
            )),
        }
    }

    async fn execute(
        &self,
        op: VmOperation,
        name: &str,
        zone: &str,
        progress: mpsc::Sender<String>,
    ) -> Result<(), ProviderError> {
        let fails = {
            let mut s = self.script.lock().unwrap();
            s.executed.push((op, name.to_string(), zone.to_string()));
            s.execute_fails
        };
        let _ = progress.send(format!("{op} {name} in progress")).await;
        if fails {
            return Err(failed(
                "instances op",
                "ERROR: Required 'compute.instances.stop' permission for 'projects/lab'",
            ));
        }
        Ok(())
    }
}
