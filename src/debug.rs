use common::ivc::{IvcRxMsg, IvcTxMsg};

/// Fails with `error` unless `cond` holds. Without an error it fails with
/// `VseError::InvalidArgument`, the code of every malformed request.
#[macro_export]
macro_rules! ensure {
    ($cond:expr) => {
        $crate::ensure!($cond, $crate::error::VseError::InvalidArgument)
    };
    ($cond:expr, $error:expr) => {
        if !$cond {
            Err::<(), $crate::error::VseError>($error)
        } else {
            Ok(())
        }
    };
}

/// Fails with `error` when `cond` holds.
#[macro_export]
macro_rules! ensure_not {
    ($cond:expr, $error:expr) => {
        if $cond {
            Err::<(), $crate::error::VseError>($error)
        } else {
            Ok(())
        }
    };
}

/// Dumps an outgoing message header and its entries at trace level.
pub(crate) fn trace_tx(msg: &IvcTxMsg) {
    if !tracing::enabled!(tracing::Level::TRACE) {
        return;
    }
    let num_reqs = msg.hdr.num_reqs.get() as usize;
    tracing::trace!(
        engine = msg.hdr.engine.get(),
        num_reqs,
        tag = ?&msg.hdr.tag[..8],
        "tx message"
    );
    for (k, entry) in msg.tx.iter().take(num_reqs).enumerate() {
        tracing::trace!(k, cmd = entry.cmd.get(), "tx entry");
    }
}

pub(crate) fn trace_rx(msg: &IvcRxMsg) {
    if !tracing::enabled!(tracing::Level::TRACE) {
        return;
    }
    let num_reqs = (msg.hdr.num_reqs.get() as usize).min(msg.rx.len());
    tracing::trace!(
        engine = msg.hdr.engine.get(),
        num_reqs,
        tag = ?&msg.hdr.tag[..8],
        "rx message"
    );
    for (k, entry) in msg.rx.iter().take(num_reqs).enumerate() {
        tracing::trace!(
            k,
            cmd = entry.cmd.get(),
            status = entry.status.get(),
            "rx entry"
        );
    }
}
