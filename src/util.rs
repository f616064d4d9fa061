use anyhow::anyhow;
use sentry_core::protocol::SpanStatus;
use sentry_core::{Hub, TransactionContext};
use std::any::Any;
use std::future::Future;

/// Runs `callback` inside a Sentry transaction on the current hub.
pub(crate) async fn with_sentry_transaction<F, R, E>(
    transaction_name: &str,
    callback: impl FnOnce() -> F,
) -> Result<R, E>
where
    F: Future<Output = Result<R, E>>,
{
    let tx_ctx = TransactionContext::new(transaction_name, "queue.job");
    let tx = sentry_core::start_transaction(tx_ctx);

    Hub::current().configure_scope(|scope| scope.set_span(Some(tx.clone().into())));

    let result = callback().await;

    tx.set_status(match result {
        Ok(_) => SpanStatus::Ok,
        Err(_) => SpanStatus::UnknownError,
    });
    tx.finish();

    result
}

/// Turns a panic payload into an error, keeping the message when there is one.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {message}")
    } else {
        anyhow!("job panicked")
    }
}
