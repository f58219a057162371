//! Mapping of HTTP status and error headers to typed failures.

use crate::error::{
    ChangesetClosed, ChangesetClosedSource, PrimitiveGone, TransferError, TransferResult,
};

/// Classifies a response.
///
/// 2xx is success. 409 with a changeset-closed header and 410 with an
/// already-deleted header become conflicts; every other non-2xx response,
/// including a 409/410 whose header does not follow the grammar, becomes
/// [`TransferError::Api`].
pub fn classify(
    status: u16,
    error_header: Option<&str>,
    body: Option<&str>,
    url: &str,
    source: ChangesetClosedSource,
) -> TransferResult<()> {
    if (200..300).contains(&status) {
        return Ok(());
    }
    match (status, error_header) {
        (409, Some(header)) if ChangesetClosed::matches(header) => Err(
            TransferError::ChangesetClosed(ChangesetClosed::from_header(Some(header), source)),
        ),
        (410, Some(header)) if PrimitiveGone::matches(header) => Err(
            TransferError::PrimitiveGone(PrimitiveGone::from_header(Some(header), body)),
        ),
        _ => Err(TransferError::Api {
            status,
            header: error_header.map(str::to_string),
            body: body.filter(|b| !b.is_empty()).map(str::to_string),
            url: url.to_string(),
        }),
    }
}
