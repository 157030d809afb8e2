//! Process-wide fault handling.
//!
//! A [`Supervisor`] is built once at the top of `main`, right after telemetry
//! and before any listener opens. Panics on any thread are fatal: they are logged once, the fatal
//! hooks run and the process exits non-zero. Background futures spawned
//! through [`Supervisor::spawn_observed`] that resolve to an error are logged
//! once and the observed hooks run; the process keeps serving. Listener
//! errors are logged and never terminate anything.

use std::{
    any::Any,
    fmt::Display,
    future::Future,
    io,
    panic::{self, PanicHookInfo},
    sync::Arc,
};

use actix_web::{dev::Server, rt::task::JoinHandle};
use gateway_domain::services::telemetry::TelemetryGuard;
use metrics::counter;
use strum_macros::IntoStaticStr;
use tracing::{error, warn};

const FAILURE_EXIT_CODE: i32 = 1;

/// Ends the process. Swapped out in tests so fatal paths can be observed.
pub trait Terminator: Send + Sync {
    fn exit(&self, code: i32);
}

#[derive(Debug, Default)]
pub struct ProcessExit;

impl Terminator for ProcessExit {
    fn exit(&self, code: i32) {
        std::process::exit(code);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum FaultKind {
    Panic,
    UnobservedFailure,
    Listener,
}

impl FaultKind {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub origin: String,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            origin: origin.into(),
            message: message.into(),
        }
    }

    fn from_panic(info: &PanicHookInfo<'_>) -> Self {
        let origin = info
            .location()
            .map(|location| format!("{}:{}", location.file(), location.line()))
            .unwrap_or_else(|| "unknown".to_string());
        Self::new(FaultKind::Panic, origin, panic_message(info.payload()))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

type Hook = Box<dyn Fn(&Fault) + Send + Sync>;

pub struct Supervisor {
    terminator: Arc<dyn Terminator>,
    fatal_hooks: Vec<Hook>,
    observed_hooks: Vec<Hook>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self::with_terminator(Arc::new(ProcessExit))
    }

    pub fn with_terminator(terminator: Arc<dyn Terminator>) -> Self {
        Self {
            terminator,
            fatal_hooks: Vec::new(),
            observed_hooks: Vec::new(),
        }
    }

    /// Runs after a fatal fault is logged, before the process exits.
    pub fn on_fatal(mut self, hook: impl Fn(&Fault) + Send + Sync + 'static) -> Self {
        self.fatal_hooks.push(Box::new(hook));
        self
    }

    /// Runs after an unhandled background failure is logged.
    pub fn on_observed(mut self, hook: impl Fn(&Fault) + Send + Sync + 'static) -> Self {
        self.observed_hooks.push(Box::new(hook));
        self
    }

    pub fn terminator(&self) -> &dyn Terminator {
        self.terminator.as_ref()
    }

    /// Replaces the process panic hook. The previous hook is not chained, so
    /// each panic produces a single log entry. Taking the telemetry guard
    /// means the hook always has a subscriber to report into.
    pub fn install(self, _telemetry: &TelemetryGuard) -> Arc<Self> {
        let supervisor = Arc::new(self);
        let hook_owner = Arc::clone(&supervisor);
        panic::set_hook(Box::new(move |info| {
            hook_owner.fatal(Fault::from_panic(info));
        }));
        supervisor
    }

    pub fn fatal(&self, fault: Fault) {
        error!(
            kind = fault.kind.as_str(),
            origin = %fault.origin,
            "uncaught fault, exiting: {}",
            fault.message
        );
        self.record(fault.kind);
        for hook in &self.fatal_hooks {
            hook(&fault);
        }
        self.terminator.exit(FAILURE_EXIT_CODE);
    }

    pub fn observe(&self, fault: Fault) {
        error!(
            kind = fault.kind.as_str(),
            origin = %fault.origin,
            "unhandled background failure: {}",
            fault.message
        );
        self.record(fault.kind);
        for hook in &self.observed_hooks {
            hook(&fault);
        }
    }

    pub fn listener_error(&self, listener: &str, err: &io::Error) {
        warn!(listener, %err, "listener error");
        self.record(FaultKind::Listener);
    }

    /// Spawns a local background task whose error, if any, is observed
    /// rather than dropped.
    pub fn spawn_observed<F, T, E>(
        self: &Arc<Self>,
        origin: &'static str,
        task: F,
    ) -> JoinHandle<()>
    where
        F: Future<Output = Result<T, E>> + 'static,
        T: 'static,
        E: Display + 'static,
    {
        let supervisor = Arc::clone(self);
        actix_web::rt::spawn(async move {
            if let Err(err) = task.await {
                supervisor.observe(Fault::new(
                    FaultKind::UnobservedFailure,
                    origin,
                    err.to_string(),
                ));
            }
        })
    }

    /// Drives a listener to completion. A listener that stops with an error
    /// is logged; the error does not propagate.
    pub async fn watch_listener(self: Arc<Self>, listener: &'static str, server: Server) {
        if let Err(err) = server.await {
            self.listener_error(listener, &err);
        }
    }

    fn record(&self, kind: FaultKind) {
        counter!(
            "gateway_supervisor_events_total",
            "kind" => kind.as_str()
        )
        .increment(1);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::Terminator;

    /// Records exit requests instead of ending the test process.
    #[derive(Debug, Default)]
    pub struct RecordingTerminator {
        codes: Mutex<Vec<i32>>,
    }

    impl RecordingTerminator {
        pub fn codes(&self) -> Vec<i32> {
            self.codes.lock().unwrap().clone()
        }
    }

    impl Terminator for RecordingTerminator {
        fn exit(&self, code: i32) {
            self.codes.lock().unwrap().push(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingTerminator;
    use super::*;
    use gateway_domain::services::telemetry::{init_telemetry, TelemetryConfig};
    use serial_test::serial;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::{layer::Context, prelude::*, Layer};

    #[derive(Clone, Default)]
    struct ErrorCounter(Arc<AtomicUsize>);

    impl ErrorCounter {
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl<S: Subscriber> Layer<S> for ErrorCounter {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == Level::ERROR {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn counting_subscriber() -> (ErrorCounter, impl Subscriber + Send + Sync) {
        let counter = ErrorCounter::default();
        let subscriber = tracing_subscriber::registry().with(counter.clone());
        (counter, subscriber)
    }

    fn hook_counter() -> (Arc<AtomicUsize>, impl Fn(&Fault) + Send + Sync + 'static) {
        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = Arc::clone(&calls);
        (calls, move |_fault: &Fault| {
            hook_calls.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn telemetry() -> TelemetryGuard {
        init_telemetry(&TelemetryConfig::from_env("GATEWAY_TEST")).expect("telemetry")
    }

    #[test]
    #[serial]
    fn panic_logs_once_runs_fatal_hooks_and_exits() {
        let telemetry = telemetry();
        let terminator = Arc::new(RecordingTerminator::default());
        let (fatal_calls, fatal_hook) = hook_counter();
        let (observed_calls, observed_hook) = hook_counter();
        let (errors, subscriber) = counting_subscriber();

        tracing::subscriber::with_default(subscriber, || {
            let _supervisor = Supervisor::with_terminator(terminator.clone())
                .on_fatal(fatal_hook)
                .on_observed(observed_hook)
                .install(&telemetry);
            let outcome = std::panic::catch_unwind(|| panic!("boom"));
            let _ = panic::take_hook();
            assert!(outcome.is_err());
        });

        assert_eq!(errors.count(), 1);
        assert_eq!(fatal_calls.load(Ordering::SeqCst), 1);
        assert_eq!(observed_calls.load(Ordering::SeqCst), 0);
        assert_eq!(terminator.codes(), vec![FAILURE_EXIT_CODE]);
    }

    #[test]
    #[serial]
    fn panics_after_install_reach_the_process_subscriber() {
        let telemetry = telemetry();
        let terminator = Arc::new(RecordingTerminator::default());
        let subscribed = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&subscribed);

        let _supervisor = Supervisor::with_terminator(terminator.clone())
            .on_fatal(move |_fault| {
                seen.store(tracing::dispatcher::has_been_set(), Ordering::SeqCst);
            })
            .install(&telemetry);
        let outcome = std::panic::catch_unwind(|| panic!("early"));
        let _ = panic::take_hook();

        assert!(outcome.is_err());
        assert!(subscribed.load(Ordering::SeqCst));
        assert_eq!(terminator.codes(), vec![FAILURE_EXIT_CODE]);
    }

    #[test]
    fn observed_failure_logs_once_and_continues() {
        let terminator = Arc::new(RecordingTerminator::default());
        let (observed_calls, observed_hook) = hook_counter();
        let (errors, subscriber) = counting_subscriber();
        let supervisor = Supervisor::with_terminator(terminator.clone()).on_observed(observed_hook);

        tracing::subscriber::with_default(subscriber, || {
            supervisor.observe(Fault::new(FaultKind::UnobservedFailure, "test", "rejected"));
        });

        assert_eq!(errors.count(), 1);
        assert_eq!(observed_calls.load(Ordering::SeqCst), 1);
        assert!(terminator.codes().is_empty());
    }

    #[actix_web::test]
    async fn spawned_failures_are_observed_and_successes_ignored() {
        let terminator = Arc::new(RecordingTerminator::default());
        let (observed_calls, observed_hook) = hook_counter();
        let supervisor = Arc::new(
            Supervisor::with_terminator(terminator.clone()).on_observed(observed_hook),
        );

        supervisor
            .spawn_observed("ok", async { Ok::<_, io::Error>(()) })
            .await
            .unwrap();
        supervisor
            .spawn_observed("failing", async {
                Err::<(), _>(io::Error::other("upstream went away"))
            })
            .await
            .unwrap();

        assert_eq!(observed_calls.load(Ordering::SeqCst), 1);
        assert!(terminator.codes().is_empty());
    }

    #[test]
    fn listener_errors_never_terminate() {
        let terminator = Arc::new(RecordingTerminator::default());
        let (fatal_calls, fatal_hook) = hook_counter();
        let supervisor = Supervisor::with_terminator(terminator.clone()).on_fatal(fatal_hook);

        supervisor.listener_error("metrics", &io::Error::other("EADDRINUSE"));

        assert_eq!(fatal_calls.load(Ordering::SeqCst), 0);
        assert!(terminator.codes().is_empty());
    }

    #[test]
    fn panic_payloads_are_rendered() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "non-string panic payload");
    }
}
