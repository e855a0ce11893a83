//! Custom macros for reducing code repetition in vitrine

/// Log an error and continue execution (non-fatal error handling)
///
/// # Example
/// ```ignore
/// log_and_continue!(producer.set_size(size), "forward size to producer");
/// ```
#[macro_export]
macro_rules! log_and_continue {
    ($expr:expr, $context:expr) => {
        if let Err(e) = $expr {
            log::error!("Failed to {}: {}", $context, e);
        }
    };
}

/// Validate an enum-like string value, yielding `anyhow::Result<()>`
///
/// # Example
/// ```ignore
/// validate_enum!(kind, "images", "videos", "feed", "on-demand")?;
/// ```
#[macro_export]
macro_rules! validate_enum {
    ($value:expr, $($variant:expr),+) => {
        match $value {
            $($variant)|+ => Ok::<(), anyhow::Error>(()),
            other => Err(anyhow::anyhow!(
                "Invalid value: {} (expected one of: {})",
                other,
                [$($variant),+].join(", ")
            )),
        }
    };
}
