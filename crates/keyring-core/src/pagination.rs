//! Address discovery.
//!
//! [`AddressPager`] derives candidate addresses for a template without
//! touching the account store, so paging is read-only and repeatable.
//! Templates whose placeholder is the last segment are fetched in one
//! batched request; templates with the placeholder earlier (such as
//! `m/44'/60'/x'/0/0`) are fetched with one request per index, because
//! signers only batch by incrementing the final index.

use core::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address::Address;
use crate::error::{Error, Result};
use crate::hd_path::PathTemplate;
use crate::session::Flight;
use crate::transport::protocol::GetAddressesParams;
use crate::transport::{DeviceRequest, DeviceResponse};

/// An address derived for an insertion index, not yet tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountCandidate {
    /// The derived address.
    pub address: Address,
    /// Insertion index the template was resolved with.
    pub index: u32,
}

/// Position in the page sequence. Never negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaginationCursor {
    page: u32,
}

impl PaginationCursor {
    /// Cursor at `page`.
    #[must_use]
    pub const fn at(page: u32) -> Self {
        Self { page }
    }

    /// The first page.
    #[must_use]
    pub const fn first() -> Self {
        Self { page: 0 }
    }

    /// The page after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self {
            page: self.page.saturating_add(1),
        }
    }

    /// The page before this one, clamped at the first page.
    #[must_use]
    pub const fn previous(self) -> Self {
        Self {
            page: self.page.saturating_sub(1),
        }
    }

    /// Moves by `delta` pages, clamped at the first page.
    #[must_use]
    pub const fn step(self, delta: i32) -> Self {
        Self {
            page: self.page.saturating_add_signed(delta),
        }
    }

    /// Current page index.
    #[must_use]
    pub const fn page(self) -> u32 {
        self.page
    }

    /// First insertion index of the page.
    #[must_use]
    pub const fn start(self, per_page: u32) -> u32 {
        self.page.saturating_mul(per_page)
    }
}

/// Fetches addresses for a template through a [`Flight`].
#[derive(Debug, Clone, Copy)]
pub struct AddressPager<'t> {
    template: &'t PathTemplate,
}

impl<'t> AddressPager<'t> {
    /// Pager for `template`.
    #[must_use]
    pub const fn new(template: &'t PathTemplate) -> Self {
        Self { template }
    }

    /// Returns `true` if this template needs one request per index.
    #[must_use]
    pub fn is_sequential(&self) -> bool {
        self.template.has_non_terminal_placeholder()
    }

    /// Fetches page `page_index` of `per_page` addresses.
    ///
    /// # Errors
    ///
    /// See [`AddressPager::fetch`].
    pub async fn page(
        &self,
        flight: &Flight<'_>,
        per_page: u32,
        page_index: u32,
        timeout: Duration,
    ) -> Result<Vec<AccountCandidate>> {
        let start = PaginationCursor::at(page_index).start(per_page);
        self.fetch(flight, start, per_page, timeout).await
    }

    /// Fetches `count` addresses starting at insertion index `start`.
    ///
    /// # Errors
    ///
    /// Returns the resolver's error for indices the template cannot
    /// resolve, the transport's error, or [`Error::UnexpectedResponse`] if
    /// the signer answers with the wrong number of addresses.
    pub async fn fetch(
        &self,
        flight: &Flight<'_>,
        start: u32,
        count: u32,
        timeout: Duration,
    ) -> Result<Vec<AccountCandidate>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let end = start
            .checked_add(count)
            .ok_or_else(|| Error::InvalidPath(format!("index range {start}+{count} overflows")))?;
        // Validate the whole range before any I/O.
        self.template.resolve(end - 1)?;

        if self.is_sequential() {
            debug!(template = %self.template, start, count, "fetching addresses one index at a time");
            let mut candidates = Vec::with_capacity(count as usize);
            for index in start..end {
                let addresses = get_addresses(flight, self.template.resolve(index)?, 1, timeout).await?;
                let [address] = addresses[..] else {
                    return Err(wrong_count(1, addresses.len()));
                };
                candidates.push(AccountCandidate { address, index });
            }
            return Ok(candidates);
        }

        debug!(template = %self.template, start, count, "fetching addresses in one batch");
        let addresses = get_addresses(flight, self.template.resolve(start)?, count, timeout).await?;
        if addresses.len() != count as usize {
            return Err(wrong_count(count as usize, addresses.len()));
        }
        Ok(addresses
            .into_iter()
            .zip(start..end)
            .map(|(address, index)| AccountCandidate { address, index })
            .collect())
    }
}

async fn get_addresses(
    flight: &Flight<'_>,
    start_path: Vec<u32>,
    count: u32,
    timeout: Duration,
) -> Result<Vec<Address>> {
    let request = DeviceRequest::GetAddresses(GetAddressesParams { start_path, count });
    match flight.request(request, timeout).await? {
        DeviceResponse::Addresses(addresses) => Ok(addresses),
        other => Err(Error::UnexpectedResponse(format!(
            "expected addresses, got {}",
            other.kind()
        ))),
    }
}

fn wrong_count(expected: usize, got: usize) -> Error {
    Error::UnexpectedResponse(format!("expected {expected} addresses, got {got}"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use test_case::test_case;

    use super::*;
    use crate::config::BusyPolicy;
    use crate::hd_path::HARDENED_OFFSET;
    use crate::session::TransportSession;
    use crate::store::OwnerId;
    use crate::transport::direct::DirectTransport;
    use crate::transport::software::SoftwareDevice;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test_case(PaginationCursor::first().previous() => 0; "previous clamps at zero")]
    #[test_case(PaginationCursor::at(2).step(-5) => 0; "step clamps at zero")]
    #[test_case(PaginationCursor::at(2).next() => 3; "next advances")]
    #[test_case(PaginationCursor::at(1).step(2) => 3; "step forward")]
    fn cursor_moves(cursor: PaginationCursor) -> u32 {
        cursor.page()
    }

    async fn connected(device: &Arc<SoftwareDevice>) -> TransportSession {
        let session = TransportSession::new(
            Arc::new(DirectTransport::new(Arc::clone(device))),
            BusyPolicy::Queue,
            TIMEOUT,
        );
        session.begin().await.unwrap().connect(None, false).await.unwrap();
        session
    }

    #[tokio::test]
    async fn terminal_placeholder_fetches_in_one_batch() {
        let device = Arc::new(SoftwareDevice::new(OwnerId::new("a")));
        let session = connected(&device).await;
        let flight = session.begin().await.unwrap();
        let template = PathTemplate::default();

        let page = AddressPager::new(&template).page(&flight, 5, 1, TIMEOUT).await.unwrap();
        assert_eq!(page.len(), 5);
        assert_eq!(page[0].index, 5);
        assert_eq!(
            page[4].address,
            SoftwareDevice::address_for(&OwnerId::new("a"), &template.resolve(9).unwrap())
        );
        assert_eq!(device.requests(), vec!["connect", "get-addresses"]);
    }

    #[tokio::test]
    async fn non_terminal_placeholder_fetches_sequentially() {
        let device = Arc::new(SoftwareDevice::new(OwnerId::new("a")));
        let session = connected(&device).await;
        let flight = session.begin().await.unwrap();
        let template = PathTemplate::parse(PathTemplate::LEDGER_LIVE).unwrap();
        let pager = AddressPager::new(&template);
        assert!(pager.is_sequential());

        let page = pager.fetch(&flight, 2, 3, TIMEOUT).await.unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(
            page[0].address,
            SoftwareDevice::address_for(
                &OwnerId::new("a"),
                &[HARDENED_OFFSET + 44, HARDENED_OFFSET + 60, HARDENED_OFFSET + 2, 0, 0]
            )
        );
        assert_eq!(device.requests().iter().filter(|a| **a == "get-addresses").count(), 3);
    }

    #[tokio::test]
    async fn paging_is_idempotent() {
        let device = Arc::new(SoftwareDevice::new(OwnerId::new("a")));
        let session = connected(&device).await;
        let flight = session.begin().await.unwrap();
        let template = PathTemplate::default();
        let pager = AddressPager::new(&template);

        let first = pager.page(&flight, 5, 1, TIMEOUT).await.unwrap();
        let second = pager.page(&flight, 5, 1, TIMEOUT).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unresolvable_range_fails_before_io() {
        let device = Arc::new(SoftwareDevice::new(OwnerId::new("a")));
        let session = connected(&device).await;
        let flight = session.begin().await.unwrap();
        let template = PathTemplate::parse("m/44'/60'/0'/0/1").unwrap();

        let err = AddressPager::new(&template).fetch(&flight, 0, 5, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::PathTooLong { depth: 6, .. }));
        assert_eq!(device.requests(), vec!["connect"]);
    }
}
