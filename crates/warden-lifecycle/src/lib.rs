//! Process life cycle management: graceful shutdown of the monitoring
//! loop and of any in-flight rotation without leaving one
//! half-applied.
//!
//! See <https://tokio.rs/tokio/topics/shutdown> for more information.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc::{Receiver as MPSCReceiver, Sender as MPSCSender};
use tokio::sync::watch::{Receiver as WatchReceiver, Sender as WatchSender};

static ACTIVE: OnceLock<Mutex<Option<Activity>>> = OnceLock::new();
static ACTIVE_COUNT: AtomicUsize = AtomicUsize::new(0);
static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);
static STOPPING: OnceLock<ShutdownState> = OnceLock::new();

/// Represents some activity which cannot be ruthlessly interrupted,
/// such as a rotation that has passed validation and is waiting out
/// its propagation delay. While any Activity instances are alive,
/// `LifeCycle::wait_for_shutdown` cannot complete.
pub struct Activity {
    tx: MPSCSender<()>,
}

impl std::fmt::Debug for Activity {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Activity").finish()
    }
}

impl Clone for Activity {
    fn clone(&self) -> Self {
        ACTIVE_COUNT.fetch_add(1, Ordering::SeqCst);
        Activity {
            tx: self.tx.clone(),
        }
    }
}

impl Drop for Activity {
    fn drop(&mut self) {
        ACTIVE_COUNT.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Activity {
    /// Obtain an Activity instance.
    /// If None is returned then the process is shutting down
    /// and no new activity can be initiated.
    pub fn get_opt() -> Option<Self> {
        let active = ACTIVE.get()?.lock().unwrap();
        let activity = active.as_ref()?;
        Some(activity.clone())
    }

    /// Obtain an Activity instance.
    /// Returns Err if the process is shutting down and no new
    /// activity can be initiated
    pub fn get() -> anyhow::Result<Self> {
        Self::get_opt().ok_or_else(|| anyhow::anyhow!("shutting down"))
    }

    pub fn is_shutting_down(&self) -> bool {
        SHUTTING_DOWN.load(Ordering::Relaxed)
    }
}

pub fn is_shutting_down() -> bool {
    SHUTTING_DOWN.load(Ordering::Relaxed)
}

struct ShutdownState {
    tx: WatchSender<()>,
    rx: WatchReceiver<()>,
    request_shutdown_tx: MPSCSender<()>,
    stop_requested: AtomicBool,
}

/// ShutdownSubscription can be used by code that is idling.
/// Select on your timeout and `shutting_down` to wake up when either
/// the timeout expires or the process is about to stop.
pub struct ShutdownSubscription {
    rx: WatchReceiver<()>,
}

impl ShutdownSubscription {
    /// Obtain a shutdown subscription. Returns None when no LifeCycle
    /// was initialized in this process (library/test usage).
    pub fn get_opt() -> Option<Self> {
        Some(Self {
            rx: STOPPING.get()?.rx.clone(),
        })
    }

    pub async fn shutting_down(&mut self) {
        self.rx.changed().await.ok();
    }
}

/// Sleep for `duration`, returning early with `true` if the process
/// began shutting down first. When no LifeCycle is initialized this
/// is a plain sleep.
pub async fn sleep_unless_shutdown(duration: std::time::Duration) -> bool {
    match ShutdownSubscription::get_opt() {
        Some(mut sub) => {
            tokio::select! {
                _ = tokio::time::sleep(duration) => false,
                _ = sub.shutting_down() => true,
            }
        }
        None => {
            tokio::time::sleep(duration).await;
            false
        }
    }
}

/// The LifeCycle struct represents the life cycle of this server
/// process. Creating an instance of it will prepare the global state
/// of the process and allow other code to work with Activity and
/// ShutdownSubscription.
pub struct LifeCycle {
    activity_rx: MPSCReceiver<()>,
    request_shutdown_rx: MPSCReceiver<()>,
}

impl LifeCycle {
    /// Initialize the process life cycle.
    /// May be called only once; will panic if called multiple times.
    pub fn new() -> Self {
        let (activity_tx, activity_rx) = tokio::sync::mpsc::channel(1);
        ACTIVE_COUNT.fetch_add(1, Ordering::SeqCst);
        ACTIVE
            .set(Mutex::new(Some(Activity { tx: activity_tx })))
            .map_err(|_| ())
            .unwrap();

        let (request_shutdown_tx, request_shutdown_rx) = tokio::sync::mpsc::channel(1);

        let (tx, rx) = tokio::sync::watch::channel(());
        STOPPING
            .set(ShutdownState {
                tx,
                rx,
                request_shutdown_tx,
                stop_requested: AtomicBool::new(false),
            })
            .map_err(|_| ())
            .unwrap();

        Self {
            activity_rx,
            request_shutdown_rx,
        }
    }

    /// Request that we shut down the process.
    /// This will cause the wait_for_shutdown method on the process
    /// LifeCycle instance to wake up and initiate the shutdown
    /// procedure.
    pub async fn request_shutdown() {
        tracing::debug!("shutdown has been requested");
        if let Some(state) = STOPPING.get() {
            if state.stop_requested.compare_exchange(
                false,
                true,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) == Ok(false)
            {
                state.request_shutdown_tx.send(()).await.ok();
            }
        } else {
            tracing::error!("request_shutdown: STOPPING channel is unavailable");
        }
    }

    /// Wait for a shutdown request, then propagate that state
    /// to running tasks, and then wait for those tasks to complete
    /// before returning to the caller.
    pub async fn wait_for_shutdown(&mut self) {
        tracing::debug!("Waiting for interrupt");
        let mut sig_term =
            tokio::signal::unix::signal(SignalKind::terminate()).expect("listen for SIGTERM");
        let mut sig_hup =
            tokio::signal::unix::signal(SignalKind::hangup()).expect("listen for SIGHUP");

        tokio::select! {
            _ = sig_term.recv() => {}
            _ = sig_hup.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
            _ = self.request_shutdown_rx.recv() => {}
        };
        tracing::info!(
            "Shutdown requested, waiting for in-flight rotations and \
             queued batch accounting to settle"
        );
        SHUTTING_DOWN.store(true, Ordering::SeqCst);
        ACTIVE.get().map(|a| a.lock().unwrap().take());
        STOPPING.get().map(|s| s.tx.send(()).ok());

        tracing::debug!("Waiting for tasks to wrap up");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(15)) => {
                    let n = ACTIVE_COUNT.load(Ordering::SeqCst);
                    tracing::info!("Still waiting for {n} pending activities...");
                }
                _ = self.activity_rx.recv() => {
                    return
                }
            }
        }
    }
}
