use std::process;
use std::sync::Arc;
use std::time::Duration;

use mediaqueue::commands::{register_builtin_commands, CommandContext, CommandRegistry};
use mediaqueue::config::AppConfig;
use mediaqueue::connection::{Clock, HttpConnection, SystemClock, UdpConnection};
use mediaqueue::events::{
    EventEmitter, CONNECTION_STATE_CHANGED_EVENT, QUEUE_COUNT_CHANGED_EVENT,
    QUEUE_STATE_CHANGED_EVENT,
};
use mediaqueue::logging::{LogLevel, Logger, LoggerConfig};
use mediaqueue::queue::{CommandQueues, QueueDependencies, QueueSettings};
use mediaqueue::shutdown::ShutdownHooks;
use mediaqueue::storage::StorageFacade;
use mediaqueue::utils::startup_banner::print_startup_banner;
use serde_json::json;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(200);
const LISTENER_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

fn main() {
    ensure_posix_or_exit();

    let app_config = load_config_or_exit();
    print_startup_banner(&app_config);

    let log_level =
        LogLevel::from_config_value(&app_config.logging.level).unwrap_or_else(|| {
            eprintln!(
                "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
                app_config.logging.level
            );
            process::exit(2);
        });
    let logger = Arc::new(Logger::new(LoggerConfig {
        min_level: log_level,
        human_friendly: app_config.logging.human_friendly,
    }));

    let storage = StorageFacade::initialize(&app_config.storage, &logger).unwrap_or_else(|error| {
        eprintln!("storage initialization error: {error}");
        process::exit(2);
    });
    let storage = Arc::new(storage);

    let emitter = Arc::new(EventEmitter::new());
    register_notification_logging(&emitter, &logger);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let udp = app_config.udp.enabled.then(|| {
        let connection = UdpConnection::from_config(
            &app_config.udp,
            Arc::clone(&clock),
            Arc::clone(&emitter),
            Arc::clone(&logger),
        )
        .unwrap_or_else(|error| {
            eprintln!("UDP connection setup error: {error}");
            process::exit(2);
        });
        Arc::new(connection)
    });
    let http = app_config.http.enabled.then(|| {
        let connection = HttpConnection::from_config(
            &app_config.http,
            Arc::clone(&clock),
            Arc::clone(&emitter),
            Arc::clone(&logger),
        )
        .unwrap_or_else(|error| {
            eprintln!("HTTP connection setup error: {error}");
            process::exit(2);
        });
        Arc::new(connection)
    });

    let mut context = CommandContext::new(Arc::clone(&logger));
    if let Some(udp) = &udp {
        context = context.with_udp(Arc::clone(udp));
    }
    if let Some(http) = &http {
        context = context.with_http(Arc::clone(http));
    }
    let mut registry = CommandRegistry::new(context);
    register_builtin_commands(&mut registry).unwrap_or_else(|error| {
        eprintln!("command registration error: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::registry"),
        "Command registry populated",
        Some(json!({ "command_types": registry.command_types() })),
    );

    let mut deps = QueueDependencies::new(
        Arc::clone(&storage),
        Arc::new(registry),
        Arc::clone(&emitter),
        Arc::clone(&logger),
    );
    if let Some(udp) = &udp {
        deps = deps.with_udp_gate(Arc::clone(udp.handler()));
    }
    if let Some(http) = &http {
        deps = deps.with_http_gate(Arc::clone(http.handler()));
    }

    let mut queues = CommandQueues::new(deps, QueueSettings::from_config(&app_config.queues))
        .unwrap_or_else(|error| {
            eprintln!("command lane initialization error: {error}");
            process::exit(2);
        });
    queues.start_all().unwrap_or_else(|error| {
        eprintln!("command lane startup error: {error}");
        process::exit(2);
    });

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    shutdown_hooks.wait(SHUTDOWN_POLL_INTERVAL, || {});

    logger.info(
        Some("main::shutdown"),
        "Shutdown signal received, starting graceful shutdown",
    );
    queues.cancel_all();
    if let Err(error) = queues.join_all() {
        logger.error(
            Some("main::shutdown"),
            &format!("command lane shutdown error: {error}"),
        );
    }
    match queues.statuses() {
        Ok(statuses) => logger.log(
            LogLevel::Info,
            Some("main::shutdown"),
            "Command lanes stopped",
            Some(json!({ "lanes": statuses })),
        ),
        Err(error) => logger.warn(
            Some("main::shutdown"),
            &format!("failed to read lane status during shutdown: {error}"),
        ),
    }

    if let Some(udp) = &udp {
        udp.close();
    }

    emitter.begin_shutdown();
    if emitter.wait_for_idle(LISTENER_DRAIN_TIMEOUT) {
        logger.info(
            Some("main::shutdown"),
            "All running listeners completed before timeout",
        );
    } else {
        logger.warn(
            Some("main::shutdown"),
            "Listener drain timeout reached; continuing shutdown",
        );
    }

    if let Err(error) = storage.flush() {
        eprintln!("storage flush error during shutdown: {error}");
        process::exit(2);
    }
    logger.info(Some("main::shutdown"), "Graceful shutdown completed");
}

/// Mirrors every core notification into the log at debug level.
fn register_notification_logging(emitter: &EventEmitter, logger: &Arc<Logger>) {
    for event_name in [
        QUEUE_COUNT_CHANGED_EVENT,
        QUEUE_STATE_CHANGED_EVENT,
        CONNECTION_STATE_CHANGED_EVENT,
    ] {
        let logger = Arc::clone(logger);
        emitter.on(event_name, move |event| {
            let payload = serde_json::to_value(&event.notification)
                .map_err(|error| format!("failed to render notification: {error}"))?;
            logger.log(
                LogLevel::Debug,
                Some("main::events"),
                &format!("event '{}'", event.name),
                Some(payload),
            );
            Ok(())
        });
    }
}

fn load_config_or_exit() -> AppConfig {
    AppConfig::load_with_discovery(std::env::args().skip(1)).unwrap_or_else(|error| {
        eprintln!("configuration error: {error}");
        process::exit(2);
    })
}

fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: mediaqueue is intended for POSIX systems");
        process::exit(2);
    }
}
