//! ---
//! vigil_section: "03-logging"
//! vigil_subsection: "module"
//! vigil_type: "source"
//! vigil_scope: "code"
//! vigil_description: "Structured logging adapters for gateway components."
//! vigil_version: "v0.1.0"
//! vigil_owner: "tbd"
//! ---

#[doc(hidden)]
#[macro_export]
macro_rules! __gw_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        $crate::tracing::event!(
            $level,
            topic = ctx.topic.unwrap_or(""),
            tag_id = ctx.tag_id.unwrap_or_default(),
            destination = ctx.destination.unwrap_or(""),
            listener = ctx.listener.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with gateway context.
#[macro_export]
macro_rules! gw_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__gw_event!($crate::tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__gw_event!($crate::tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with gateway context.
#[macro_export]
macro_rules! gw_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__gw_event!($crate::tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__gw_event!($crate::tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with gateway context.
#[macro_export]
macro_rules! gw_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__gw_event!($crate::tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__gw_event!($crate::tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with gateway context.
#[macro_export]
macro_rules! gw_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__gw_event!($crate::tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__gw_event!($crate::tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
