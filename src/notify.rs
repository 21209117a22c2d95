//! In-app notification helpers for filing events.

use anyhow::Result;

use crate::models::FilingPayload;
use crate::state_store::StateStore;

pub const NOTIFICATION_FILING_FOUND: &str = "FILING_FOUND";

/// Create one notification per subscribed user per new filing. Returns the
/// number of notifications created.
pub async fn create_filing_notifications(
    state_store: &StateStore,
    payloads: &[FilingPayload],
    org_id: &str,
) -> Result<usize> {
    let mut created = 0usize;
    for payload in payloads {
        let subscribers = state_store
            .list_watchlist_subscribers(org_id, &payload.ticker)
            .await?;
        for user_id in subscribers {
            let title = format!("New {} filing detected", payload.ticker);
            let body = format!(
                "A new filing ({}) was detected for {}. {}",
                payload.accession_number, payload.ticker, payload.filing_url
            );
            state_store
                .create_notification(
                    org_id,
                    &user_id,
                    &payload.ticker,
                    &payload.accession_number,
                    NOTIFICATION_FILING_FOUND,
                    &title,
                    &body,
                )
                .await?;
            created += 1;
        }
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;

    fn payload(ticker: &str, accession: &str) -> FilingPayload {
        FilingPayload {
            ticker: ticker.to_string(),
            accession_number: accession.to_string(),
            filing_url: format!("https://x/{accession}.htm"),
            market: "US_SEC".to_string(),
            exchange: "SEC".to_string(),
            issuer_id: String::new(),
            source: "sec".to_string(),
            source_event_id: accession.to_string(),
            raw_text: String::new(),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_one_notification_per_subscriber_per_filing() {
        let pool = crate::db::connect_memory().await.unwrap();
        migrate::migrate_state(&pool).await.unwrap();
        let store = StateStore::new(pool);

        store.add_watchlist_ticker("default", "u1", "AAPL").await.unwrap();
        store.add_watchlist_ticker("default", "u2", "AAPL").await.unwrap();
        store.add_watchlist_ticker("default", "u1", "MSFT").await.unwrap();

        let created = create_filing_notifications(
            &store,
            &[payload("AAPL", "A1"), payload("MSFT", "M1"), payload("NVDA", "N1")],
            "default",
        )
        .await
        .unwrap();

        // AAPL x 2 subscribers + MSFT x 1; NVDA has none.
        assert_eq!(created, 3);
        assert_eq!(store.count_unread_notifications("default", "u1").await.unwrap(), 2);
        assert_eq!(store.count_unread_notifications("default", "u2").await.unwrap(), 1);

        let list = store.list_notifications("default", "u1", 10, false).await.unwrap();
        assert!(list.iter().any(|n| n.title == "New AAPL filing detected"));
        assert!(list.iter().all(|n| n.notification_type == NOTIFICATION_FILING_FOUND));
    }
}
