//! Process-wide session manager.
//!
//! Scripts and agents call tools through one shared [`SessionManager`] so
//! servers are started once per process. After the shared manager is
//! cleaned up the slot empties and the next access builds a fresh,
//! uninitialized manager that re-reads configuration.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::dispatch::CleanupReport;
use super::errors::McpResult;
use super::manager::SessionManager;
use super::types::ToolCallResult;

static INSTANCE: Mutex<Option<Arc<SessionManager>>> = Mutex::new(None);

fn lock_slot() -> MutexGuard<'static, Option<Arc<SessionManager>>> {
    INSTANCE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The shared manager, created with default settings on first use.
pub fn get_instance() -> Arc<SessionManager> {
    get_or_init_instance(SessionManager::new)
}

/// The shared manager, created by `init` if the slot is empty.
///
/// Concurrent first accesses all observe the same manager.
pub fn get_or_init_instance<F>(init: F) -> Arc<SessionManager>
where
    F: FnOnce() -> SessionManager,
{
    let mut slot = lock_slot();
    if let Some(manager) = slot.as_ref() {
        return manager.clone();
    }

    let manager = Arc::new(init());
    *slot = Some(manager.clone());
    tracing::debug!("created shared MCP session manager");
    manager
}

/// Empty the slot without closing anything, returning what it held.
pub fn reset_instance() -> Option<Arc<SessionManager>> {
    lock_slot().take()
}

/// Empty the slot if it holds `manager`.
pub(crate) fn release_instance(manager: &SessionManager) {
    let mut slot = lock_slot();
    let holds_manager = slot
        .as_ref()
        .is_some_and(|held| std::ptr::eq(Arc::as_ptr(held), manager));
    if holds_manager {
        *slot = None;
        tracing::debug!("released shared MCP session manager");
    }
}

/// Invoke a tool through the shared manager.
pub async fn call_mcp_tool(name: &str, arguments: serde_json::Value) -> McpResult<ToolCallResult> {
    get_instance().call_tool(name, arguments).await
}

/// Clean up the shared manager, if one exists.
pub async fn cleanup_instance() -> Option<CleanupReport> {
    let manager = lock_slot().clone()?;
    Some(manager.cleanup().await)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serial_test::serial;

    use crate::mcp_client::manager::SessionState;
    use crate::mcp_client::testing::{config_for, FakeConnector, FakeServer};

    fn fake_manager(connector: Arc<FakeConnector>, loads: Arc<AtomicUsize>) -> SessionManager {
        SessionManager::with_parts(
            connector,
            Arc::new(move || {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(config_for(&["A"]))
            }),
        )
    }

    #[test]
    #[serial]
    fn test_concurrent_first_access_shares_instance() {
        reset_instance();

        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| Arc::as_ptr(&get_instance()) as usize))
            .collect();
        let ptrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ptrs.windows(2).all(|w| w[0] == w[1]));

        reset_instance();
    }

    #[tokio::test]
    #[serial]
    async fn test_cleanup_releases_shared_instance() {
        reset_instance();
        let connector = Arc::new(FakeConnector::new(vec![FakeServer::new("A", &["x"])]));
        let loads = Arc::new(AtomicUsize::new(0));

        let first = get_or_init_instance(|| fake_manager(connector.clone(), loads.clone()));
        first.call_tool("x", serde_json::json!({})).await.unwrap();

        let report = cleanup_instance().await.unwrap();
        assert_eq!(report.closed, vec!["A".to_string()]);
        assert_eq!(first.state(), SessionState::Closed);
        assert!(cleanup_instance().await.is_none());

        let second = get_or_init_instance(|| fake_manager(connector.clone(), loads.clone()));
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.state(), SessionState::Uninitialized);

        second.call_tool("x", serde_json::json!({})).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);

        second.cleanup().await;
        reset_instance();
    }

    #[tokio::test]
    #[serial]
    async fn test_cleanup_of_other_manager_keeps_slot() {
        reset_instance();
        let connector = Arc::new(FakeConnector::new(vec![FakeServer::new("A", &["x"])]));
        let loads = Arc::new(AtomicUsize::new(0));

        let shared = get_or_init_instance(|| fake_manager(connector.clone(), loads.clone()));
        let private = fake_manager(connector, loads);
        private.cleanup().await;

        let again = get_instance();
        assert!(Arc::ptr_eq(&shared, &again));
        reset_instance();
    }

    #[test]
    #[serial]
    fn test_reset_instance_returns_held_manager() {
        reset_instance();
        let held = get_instance();
        let taken = reset_instance().unwrap();
        assert!(Arc::ptr_eq(&held, &taken));
        assert!(reset_instance().is_none());
    }
}
