//! Readiness waiting for launched instances
//!
//! An instance reported `running` may not yet accept SSH connections, so the
//! waiter polls the fleet state and then probes the SSH port, both inside one
//! deadline. Time comes from tokio's clock, which tests pause and advance.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::fleet::{FleetClient, InstanceDescriptor};
use crate::Error;

/// Trait for checking whether a host accepts connections on a port
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Whether `host:port` accepts a TCP connection
    async fn is_reachable(&self, host: &str, port: u16) -> bool;
}

/// TCP connect probe
#[derive(Clone, Debug)]
pub struct TcpProbe {
    connect_timeout: Duration,
}

impl TcpProbe {
    /// Create a probe with the given connect timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn is_reachable(&self, host: &str, port: u16) -> bool {
        matches!(
            timeout(self.connect_timeout, TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        )
    }
}

/// Polling bounds for the waiter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadinessConfig {
    /// Give up after this long
    pub timeout: Duration,
    /// Delay between polls
    pub poll_interval: Duration,
    /// Port that must accept connections
    pub ssh_port: u16,
    /// Probe the public address first when present
    pub prefer_public_address: bool,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
            ssh_port: 22,
            prefer_public_address: true,
        }
    }
}

/// Waits for an instance to become usable for remote commands
pub struct ReadinessWaiter {
    fleet: Arc<dyn FleetClient>,
    probe: Arc<dyn ReachabilityProbe>,
    config: ReadinessConfig,
}

impl ReadinessWaiter {
    /// Create a waiter
    pub fn new(
        fleet: Arc<dyn FleetClient>,
        probe: Arc<dyn ReachabilityProbe>,
        config: ReadinessConfig,
    ) -> Self {
        Self {
            fleet,
            probe,
            config,
        }
    }

    /// Poll until the instance is running and reachable, or the deadline passes
    ///
    /// Returns the descriptor observed when the instance became ready.
    pub async fn wait_until_ready(&self, instance_id: &str) -> Result<InstanceDescriptor, Error> {
        let start = Instant::now();
        let deadline = start + self.config.timeout;
        let mut last_state = "unknown".to_string();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match self.fleet.describe_instance(instance_id).await {
                Ok(Some(instance)) => {
                    last_state = instance.state.as_str().to_string();

                    if instance.state.is_terminal() {
                        warn!(instance_id = %instance_id, state = %last_state, "Instance will never become ready");
                        return Err(Error::ReadinessTimeout {
                            instance_id: instance_id.to_string(),
                            waited: start.elapsed(),
                            last_state,
                        });
                    }

                    if instance.state == crate::fleet::InstanceState::Running {
                        match instance.reachable_address(self.config.prefer_public_address) {
                            Some(address) => {
                                if self.probe.is_reachable(address, self.config.ssh_port).await {
                                    info!(
                                        instance_id = %instance_id,
                                        address = %address,
                                        attempts = attempt,
                                        "Instance ready"
                                    );
                                    return Ok(instance);
                                }
                                last_state = "running (ssh unreachable)".to_string();
                            }
                            None => {
                                last_state = "running (no address)".to_string();
                            }
                        }
                    }
                }
                Ok(None) => {
                    last_state = "not found".to_string();
                }
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "Describe failed while waiting for readiness");
                }
            }

            let now = Instant::now();
            if now + self.config.poll_interval > deadline {
                return Err(Error::ReadinessTimeout {
                    instance_id: instance_id.to_string(),
                    waited: now - start,
                    last_state,
                });
            }

            debug!(
                instance_id = %instance_id,
                state = %last_state,
                attempt = attempt,
                "Instance not ready, polling again"
            );
            sleep(self.config.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::{InstanceState, MockFleetClient};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn instance(state: InstanceState) -> InstanceDescriptor {
        InstanceDescriptor {
            instance_id: "i-1".to_string(),
            private_address: Some("10.0.1.5".to_string()),
            public_address: None,
            private_dns_name: None,
            state,
        }
    }

    fn config() -> ReadinessConfig {
        ReadinessConfig {
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            ssh_port: 22,
            prefer_public_address: true,
        }
    }

    fn reachable(yes: bool) -> Arc<MockReachabilityProbe> {
        let mut probe = MockReachabilityProbe::new();
        probe.expect_is_reachable().returning(move |_, _| yes);
        Arc::new(probe)
    }

    /// Story: a launched instance goes pending → running and is accepted
    /// once its SSH port answers
    #[tokio::test(start_paused = true)]
    async fn story_pending_instance_becomes_ready() {
        let polls = Arc::new(AtomicU32::new(0));
        let polls_clone = polls.clone();

        let mut fleet = MockFleetClient::new();
        fleet.expect_describe_instance().returning(move |_| {
            let n = polls_clone.fetch_add(1, Ordering::SeqCst);
            let state = if n < 2 {
                InstanceState::Pending
            } else {
                InstanceState::Running
            };
            Ok(Some(instance(state)))
        });

        let waiter = ReadinessWaiter::new(Arc::new(fleet), reachable(true), config());
        let ready = waiter.wait_until_ready("i-1").await.unwrap();

        assert_eq!(ready.state, InstanceState::Running);
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn story_instance_stuck_pending_times_out() {
        let mut fleet = MockFleetClient::new();
        fleet
            .expect_describe_instance()
            .returning(|_| Ok(Some(instance(InstanceState::Pending))));

        let waiter = ReadinessWaiter::new(Arc::new(fleet), reachable(true), config());
        let err = waiter.wait_until_ready("i-1").await.unwrap_err();

        match err {
            Error::ReadinessTimeout {
                instance_id,
                waited,
                last_state,
            } => {
                assert_eq!(instance_id, "i-1");
                assert_eq!(last_state, "pending");
                assert!(waited <= Duration::from_secs(60));
            }
            other => panic!("expected ReadinessTimeout, got {other:?}"),
        }
    }

    /// Story: running but sshd not yet listening is not ready
    #[tokio::test(start_paused = true)]
    async fn story_running_but_unreachable_times_out() {
        let mut fleet = MockFleetClient::new();
        fleet
            .expect_describe_instance()
            .returning(|_| Ok(Some(instance(InstanceState::Running))));

        let waiter = ReadinessWaiter::new(Arc::new(fleet), reachable(false), config());
        let err = waiter.wait_until_ready("i-1").await.unwrap_err();
        assert!(err.to_string().contains("ssh unreachable"));
    }

    #[tokio::test(start_paused = true)]
    async fn story_terminated_instance_fails_without_waiting() {
        let mut fleet = MockFleetClient::new();
        fleet
            .expect_describe_instance()
            .times(1)
            .returning(|_| Ok(Some(instance(InstanceState::Terminated))));

        let waiter = ReadinessWaiter::new(Arc::new(fleet), reachable(true), config());
        let err = waiter.wait_until_ready("i-1").await.unwrap_err();
        assert_eq!(err.kind(), "ReadinessTimeout");
        assert!(err.to_string().contains("terminated"));
    }

    /// Story: transient API errors and eventual-consistency "not found"
    /// responses right after launch do not abort the wait
    #[tokio::test(start_paused = true)]
    async fn story_transient_describe_errors_keep_polling() {
        let polls = Arc::new(AtomicU32::new(0));
        let polls_clone = polls.clone();

        let mut fleet = MockFleetClient::new();
        fleet.expect_describe_instance().returning(move |_| {
            match polls_clone.fetch_add(1, Ordering::SeqCst) {
                0 => Err(Error::fleet("i-1", "throttled")),
                1 => Ok(None),
                _ => Ok(Some(instance(InstanceState::Running))),
            }
        });

        let waiter = ReadinessWaiter::new(Arc::new(fleet), reachable(true), config());
        assert!(waiter.wait_until_ready("i-1").await.is_ok());
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn probes_public_address_when_preferred() {
        let mut fleet = MockFleetClient::new();
        fleet.expect_describe_instance().returning(|_| {
            let mut i = instance(InstanceState::Running);
            i.public_address = Some("13.48.0.7".to_string());
            Ok(Some(i))
        });

        let mut probe = MockReachabilityProbe::new();
        probe
            .expect_is_reachable()
            .withf(|host, port| host == "13.48.0.7" && *port == 22)
            .times(1)
            .returning(|_, _| true);

        let waiter = ReadinessWaiter::new(Arc::new(fleet), Arc::new(probe), config());
        assert!(waiter.wait_until_ready("i-1").await.is_ok());
    }

    #[tokio::test]
    async fn tcp_probe_reports_closed_port() {
        let probe = TcpProbe::new(Duration::from_millis(200));
        assert!(!probe.is_reachable("127.0.0.1", 1).await);
    }

    #[tokio::test]
    async fn tcp_probe_reports_listening_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpProbe::new(Duration::from_secs(1));
        assert!(probe.is_reachable("127.0.0.1", port).await);
    }
}
