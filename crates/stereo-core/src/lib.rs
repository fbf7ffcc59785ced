// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use thiserror::Error;

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .try_init();
}

/// Fatal failure categories. Anything that ends up here aborts startup or
/// terminates the render loop; recoverable conditions never use it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("XR runtime call failed")]
    XrRuntime,
    #[error("Vulkan call failed")]
    Vulkan,
    #[error("no suitable physical device or queue family")]
    NoSuitableDevice,
    #[error("no suitable image format")]
    NoSuitableFormat,
    #[error("no suitable memory type")]
    NoMemoryType,
    #[error("invalid configuration")]
    Config,
    #[error("frame loop failure")]
    FrameLoop,
}

/// Error carrying its kind plus optional detail.
#[derive(Debug, Error)]
#[error("{kind}{}", .context.as_deref().map(|c| format!(": {c}")).unwrap_or_default())]
pub struct Reported {
    pub kind: ErrorKind,
    pub context: Option<String>,
}

/// Single reporting surface for fatal errors: logs once, hands back an
/// error the caller can propagate with `?`.
pub fn report(kind: ErrorKind, context: Option<&str>) -> anyhow::Error {
    match context {
        Some(c) => tracing::error!("{kind}: {c}"),
        None => tracing::error!("{kind}"),
    }
    Reported {
        kind,
        context: context.map(str::to_owned),
    }
    .into()
}

/// Kind of a reported error, if it went through [`report`].
pub fn kind_of(err: &anyhow::Error) -> Option<ErrorKind> {
    err.downcast_ref::<Reported>().map(|r| r.kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_keeps_kind_and_context() {
        let err = report(ErrorKind::Vulkan, Some("vkCreateFence"));
        assert_eq!(kind_of(&err), Some(ErrorKind::Vulkan));
        assert_eq!(err.to_string(), "Vulkan call failed: vkCreateFence");
    }

    #[test]
    fn report_without_context() {
        let err = report(ErrorKind::NoSuitableFormat, None);
        assert_eq!(err.to_string(), "no suitable image format");
    }

    #[test]
    fn foreign_errors_have_no_kind() {
        let err = anyhow::anyhow!("plain");
        assert_eq!(kind_of(&err), None);
    }
}
