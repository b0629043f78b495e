//! Bounded pool of reusable browser-automation handles.
//!
//! Drivers are expensive to create and can silently die between uses.
//! The pool hides both: `acquire` health-probes every handle it gives
//! out and transparently replaces dead ones, and the RAII guard returns
//! the handle on every exit path, so the outstanding-handle count never
//! exceeds the configured size.

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};

use crate::error::AppError;

/// Creates, probes and tears down automation handles.
pub trait DriverFactory: Send + Sync + Clone + 'static {
    type Driver: Send + 'static;

    fn create(&self) -> impl Future<Output = Result<Self::Driver, AppError>> + Send;

    /// Liveness probe. A `false` result causes the pool to discard the
    /// handle and create a fresh one before handing anything out.
    fn probe(&self, driver: &mut Self::Driver) -> impl Future<Output = bool> + Send;

    /// Best-effort teardown. The pool logs and swallows any error.
    fn teardown(&self, driver: Self::Driver) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Fixed-size pool of drivers with exclusive checkout.
///
/// Size is set at construction, equal to the owning stage's thread
/// count, so pool pressure equals the concurrency level.
pub struct DriverPool<F: DriverFactory> {
    factory: F,
    returns: mpsc::Sender<F::Driver>,
    idle: Mutex<Option<mpsc::Receiver<F::Driver>>>,
    /// Slots whose replacement driver failed to create. Refilled lazily
    /// by later acquires so the pool never shrinks permanently.
    lost_slots: AtomicUsize,
    size: usize,
}

impl<F: DriverFactory> DriverPool<F> {
    /// Eagerly create `size` drivers. Fails if any creation fails; the
    /// already-created drivers are torn down first.
    pub async fn new(factory: F, size: usize) -> Result<Self, AppError> {
        let (returns, rx) = mpsc::channel(size.max(1));

        for created in 0..size {
            match factory.create().await {
                Ok(driver) => {
                    // Capacity equals size, so this send cannot fail.
                    let _ = returns.try_send(driver);
                }
                Err(e) => {
                    tracing::error!(created, error = %e, "Driver pool construction failed");
                    let mut rx = rx;
                    while let Ok(driver) = rx.try_recv() {
                        if let Err(e) = factory.teardown(driver).await {
                            tracing::warn!(error = %e, "Driver teardown failed during pool rollback");
                        }
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            factory,
            returns,
            idle: Mutex::new(Some(rx)),
            lost_slots: AtomicUsize::new(0),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Check out a driver, blocking until one is free.
    ///
    /// An unhealthy driver is discarded and replaced transparently; only
    /// replacement-creation failure surfaces, and callers treat that as
    /// an ordinary attempt failure.
    pub async fn acquire(&self) -> Result<PooledDriver<F>, AppError> {
        // Refill a slot lost to an earlier failed replacement before
        // waiting on the channel, otherwise that capacity is gone.
        if self.take_lost_slot() {
            match self.factory.create().await {
                Ok(driver) => {
                    return Ok(PooledDriver {
                        driver: Some(driver),
                        returns: self.returns.clone(),
                    });
                }
                Err(e) => {
                    self.lost_slots.fetch_add(1, Ordering::AcqRel);
                    return Err(e);
                }
            }
        }

        let mut driver = {
            let mut idle = self.idle.lock().await;
            let rx = idle
                .as_mut()
                .ok_or_else(|| AppError::Browser("driver pool is shut down".into()))?;
            rx.recv()
                .await
                .ok_or_else(|| AppError::Browser("driver pool is shut down".into()))?
        };

        if !self.factory.probe(&mut driver).await {
            tracing::warn!("Driver failed liveness probe, replacing");
            if let Err(e) = self.factory.teardown(driver).await {
                tracing::warn!(error = %e, "Teardown of unhealthy driver failed");
            }
            driver = match self.factory.create().await {
                Ok(fresh) => fresh,
                Err(e) => {
                    tracing::error!(error = %e, "Driver replacement failed");
                    self.lost_slots.fetch_add(1, Ordering::AcqRel);
                    return Err(e);
                }
            };
        }

        Ok(PooledDriver {
            driver: Some(driver),
            returns: self.returns.clone(),
        })
    }

    fn take_lost_slot(&self) -> bool {
        self.lost_slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Drain and tear down all idle drivers. Idempotent; teardown errors
    /// are logged, never propagated. Call after all guards have been
    /// dropped so every handle is back in the pool.
    pub async fn shutdown(&self) {
        let rx = self.idle.lock().await.take();
        let Some(mut rx) = rx else {
            return;
        };
        rx.close();
        while let Ok(driver) = rx.try_recv() {
            if let Err(e) = self.factory.teardown(driver).await {
                tracing::warn!(error = %e, "Driver teardown failed during pool shutdown");
            }
        }
    }
}

/// Exclusive handle to one pooled driver. Returned to the pool on drop,
/// whatever the exit path. After `shutdown` the return channel is gone
/// and the driver is simply dropped.
pub struct PooledDriver<F: DriverFactory> {
    driver: Option<F::Driver>,
    returns: mpsc::Sender<F::Driver>,
}

impl<F: DriverFactory> Deref for PooledDriver<F> {
    type Target = F::Driver;

    fn deref(&self) -> &Self::Target {
        self.driver.as_ref().expect("driver present until drop")
    }
}

impl<F: DriverFactory> DerefMut for PooledDriver<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.driver.as_mut().expect("driver present until drop")
    }
}

impl<F: DriverFactory> Drop for PooledDriver<F> {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            // Outstanding handles never exceed capacity, so the only
            // failure mode is a closed channel after shutdown.
            let _ = self.returns.try_send(driver);
        }
    }
}
