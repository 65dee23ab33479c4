use std::time::Duration;
use anyhow::bail;

pub struct CoreConfig {
    /// This is the period at which the connection worker scans all sockets that are connecting:
    ///  it advances their handshakes and enforces their deadlines. It bounds how late a connect
    ///  timeout can be detected, so it should stay in the order of a few milliseconds - the
    ///  overshoot of a connect timeout is at most one tick plus scheduling jitter.
    pub worker_tick: Duration,

    /// The interval after which an unanswered handshake request is sent again. Datagrams can get
    ///  lost, and the handshake has no other means of recovery than re-sending within the
    ///  connect timeout.
    pub handshake_resend_interval: Duration,

    /// Waiting on an epoll context wakes up on every published state change, but readiness that
    ///  is reported by the data path without notification is picked up only by re-evaluation.
    ///  This is the upper bound for that re-evaluation.
    pub epoll_recheck_interval: Duration,

    /// The `connect_timeout` option of newly created sockets
    pub default_connect_timeout: Duration,

    /// Creating sockets beyond this number of live sockets fails with `ResourceExhausted`
    pub max_sockets: usize,
    /// Creating epoll contexts beyond this number fails with `ResourceExhausted`
    pub max_epoll_contexts: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            worker_tick: Duration::from_millis(10),
            handshake_resend_interval: Duration::from_millis(250),
            epoll_recheck_interval: Duration::from_millis(100),
            default_connect_timeout: Duration::from_millis(3000),
            max_sockets: 65_536,
            max_epoll_contexts: 1024,
        }
    }
}

impl CoreConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_tick.is_zero() {
            bail!("worker tick must be positive");
        }
        if self.worker_tick > Duration::from_millis(100) {
            bail!("worker tick of {:?} is too coarse for enforcing connect timeouts", self.worker_tick);
        }
        if self.handshake_resend_interval < self.worker_tick {
            bail!("handshake resend interval must not be shorter than the worker tick");
        }
        if self.epoll_recheck_interval.is_zero() {
            bail!("epoll re-check interval must be positive");
        }
        if self.default_connect_timeout.is_zero() {
            bail!("default connect timeout must be positive");
        }
        if self.max_sockets == 0 || self.max_epoll_contexts == 0 {
            bail!("socket and epoll limits must be positive");
        }
        Ok(())
    }
}
