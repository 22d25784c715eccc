//! Periodic background routines.
//!
//! The enqueuer, both resetters, and the retention sweeper are
//! [`Routine`]s: a single pass of work that's repeated on a fixed period by
//! [`Periodic::run`] until its cancellation token fires. A pass never fails
//! the loop; routines log (and count) their own errors and try again on the
//! next tick.

use std::future::Future;

use jiff::Span;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Periodic task errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The period couldn't be converted into a duration.
    #[error(transparent)]
    Jiff(#[from] jiff::Error),

    /// The period is zero.
    #[error("Period of `{0}` must be non-zero")]
    ZeroPeriod(&'static str),
}

/// One pass of a periodic routine.
pub trait Routine: Send + Sync + 'static {
    /// Name used in logs.
    const NAME: &'static str;

    /// Performs one pass.
    fn tick(&self) -> impl Future<Output = ()> + Send;
}

/// Repeats a [`Routine`] on a fixed period.
#[derive(Debug)]
pub struct Periodic<R> {
    routine: R,
    period: Span,
}

impl<R: Routine> Periodic<R> {
    /// Creates a loop running `routine` every `period`.
    pub fn new(routine: R, period: Span) -> Self {
        Self { routine, period }
    }

    /// Returns the wrapped routine.
    pub fn routine(&self) -> &R {
        &self.routine
    }

    /// Runs the routine immediately and then once per period until
    /// `shutdown_token` is cancelled.
    ///
    /// A pass in progress when the token fires is allowed to finish.
    #[instrument(skip_all, fields(routine = R::NAME), err)]
    pub async fn run(&self, shutdown_token: CancellationToken) -> Result<(), Error> {
        let period = std::time::Duration::try_from(self.period)?;
        if period.is_zero() {
            return Err(Error::ZeroPeriod(R::NAME));
        }

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    debug!("Shutdown signal received, stopping");
                    break;
                }

                _ = interval.tick() => {
                    self.routine.tick().await;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use jiff::ToSpan;

    use super::*;

    #[derive(Debug, Default, Clone)]
    struct Counter(Arc<AtomicUsize>);

    impl Routine for Counter {
        const NAME: &'static str = "counter";

        async fn tick(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_immediately_then_every_period() {
        let counter = Counter::default();
        let periodic = Arc::new(Periodic::new(counter.clone(), 1.minute()));
        let token = CancellationToken::new();

        let handle = tokio::spawn({
            let periodic = periodic.clone();
            let token = token.clone();
            async move { periodic.run(token).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);

        token.cancel();
        handle.await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejects_zero_period() {
        let periodic = Periodic::new(Counter::default(), 0.seconds());

        assert!(matches!(
            periodic.run(CancellationToken::new()).await,
            Err(Error::ZeroPeriod("counter"))
        ));
    }
}
