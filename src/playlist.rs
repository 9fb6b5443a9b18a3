//! Bounded accumulation over token-paginated list APIs.
//!
//! [`fetch_all`] walks pages until the API runs out of items, stops handing
//! out tokens, or the caller's cap is reached. Failures are logged and the
//! items gathered so far are returned: playlist import is best effort.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::JukeboxResult;

/// One page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Opaque server-issued token, `None` for the first page.
    pub page_token: Option<String>,
    pub max_results: usize,
}

impl PageRequest {
    pub fn first(max_results: usize) -> Self {
        Self {
            page_token: None,
            max_results,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

/// An external list endpoint that pages with opaque continuation tokens.
#[cfg_attr(test, mockall::automock(type Item = String;))]
#[async_trait]
pub trait PagedList: Send + Sync {
    type Item: Send;

    async fn list(&self, request: &PageRequest) -> JukeboxResult<Page<Self::Item>>;
}

/// Fetches pages starting at `initial` until one of the stopping conditions
/// holds, never returning more than `max_items`.
///
/// Every follow-up request asks for exactly the remaining capacity. A failed
/// request ends the walk with whatever was accumulated before it.
pub async fn fetch_all<L>(api: &L, initial: PageRequest, max_items: usize) -> Vec<L::Item>
where
    L: PagedList + ?Sized,
{
    let mut accumulated: Vec<L::Item> = Vec::new();
    if max_items == 0 {
        return accumulated;
    }

    let mut request = PageRequest {
        max_results: if initial.max_results == 0 {
            max_items
        } else {
            initial.max_results.min(max_items)
        },
        ..initial
    };
    let mut pages = 0usize;

    loop {
        let page = match api.list(&request).await {
            Ok(page) => page,
            Err(e) => {
                warn!(
                    "⚠️ Fallo al pedir la página {}: {} - devolviendo {} items parciales",
                    pages + 1,
                    e,
                    accumulated.len()
                );
                return accumulated;
            }
        };
        pages += 1;

        if page.items.is_empty() {
            debug!("Página {} vacía, fin de la lista", pages);
            break;
        }

        accumulated.extend(page.items);
        accumulated.truncate(max_items);
        let remaining = max_items - accumulated.len();

        let Some(token) = page.next_token else {
            break;
        };
        if remaining == 0 {
            debug!("Capacidad agotada tras {} páginas", pages);
            break;
        }

        request = PageRequest {
            page_token: Some(token),
            max_results: remaining,
        };
    }

    info!(
        "📄 {} items obtenidos en {} páginas (límite {})",
        accumulated.len(),
        pages,
        max_items
    );
    accumulated
}
