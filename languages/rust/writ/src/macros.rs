/// Create a custom [`WritError`](crate::errors::WritError), with a syntax similar to `format!()`.
#[macro_export]
macro_rules! lazy_error {
    ($($input:tt)*) => {
        Err($crate::errors::WritError::Custom {
            message: format!($($input)*),
        })
    };
}

/// Forward the `print` output and warnings queued on an engine or query
/// to `tracing`.
macro_rules! check_messages {
    ($source:expr) => {
        while let Some(message) = $source.next_message() {
            if message.kind == ::writ_core::messages::MessageKind::Warning {
                ::tracing::warn!(target: "writ", "{}", message.msg);
            } else {
                ::tracing::info!(target: "writ", "{}", message.msg);
            }
        }
    };
}
