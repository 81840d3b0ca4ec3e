//! Per-run context: VM name for log prefixes, an optional overall deadline
//! and a cancellation token. Every polling sleep goes through [`RunContext`].

use crate::error::{CloneError, CloneResult};

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cap for deadlines whose timeout does not fit into an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + timeout`, saturating at [`FAR_FUTURE`].
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout.min(FAR_FUTURE)).unwrap_or(now)
}

#[derive(Debug, Clone)]
pub struct RunContext {
    vm_name: String,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(vm_name: impl Into<String>) -> Self {
        Self {
            vm_name: vm_name.into(),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(deadline_after(timeout))
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail if the run was cancelled or its deadline has passed.
    pub fn check(&self) -> CloneResult<()> {
        if self.cancel.is_cancelled() {
            return Err(CloneError::cancelled(format!("Run for {} cancelled", self.vm_name)));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(self.deadline_error());
            }
        }
        Ok(())
    }

    pub async fn sleep(&self, duration: Duration) -> CloneResult<()> {
        self.sleep_until(deadline_after(duration)).await
    }

    /// Sleep until `until`, cut short by the run deadline or cancellation.
    pub async fn sleep_until(&self, until: Instant) -> CloneResult<()> {
        self.check()?;
        let (wake, past_deadline) = match self.deadline {
            Some(deadline) if deadline < until => (deadline, true),
            _ => (until, false),
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {
                Err(CloneError::cancelled(format!("Run for {} cancelled", self.vm_name)))
            }
            _ = tokio::time::sleep_until(wake) => {
                if past_deadline {
                    Err(self.deadline_error())
                } else {
                    Ok(())
                }
            }
        }
    }

    fn deadline_error(&self) -> CloneError {
        CloneError::timeout(format!("Run deadline for {} exceeded", self.vm_name))
    }
}

/// Ticks of a bounded polling loop.
///
/// The first poll happens right away; later ones every `interval`, strictly
/// before `timeout`. Once no full interval is left the poller sleeps out the
/// remainder, so a failing loop never ends earlier than `timeout`.
#[derive(Debug, Clone)]
pub struct Poller {
    deadline: Instant,
    interval: Duration,
}

impl Poller {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            deadline: deadline_after(timeout),
            interval,
        }
    }

    /// Wait for the next tick. `Ok(false)` means the window is over.
    pub async fn next(&mut self, ctx: &RunContext) -> CloneResult<bool> {
        let now = Instant::now();
        if self.deadline.saturating_duration_since(now) <= self.interval {
            if now < self.deadline {
                ctx.sleep_until(self.deadline).await?;
            }
            return Ok(false);
        }
        ctx.sleep(self.interval).await?;
        Ok(true)
    }
}
