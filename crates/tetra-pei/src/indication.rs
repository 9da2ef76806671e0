//! Unsolicited indication dispatch.
//!
//! The radio emits indications (`+CTSDSR: ...`, `+CTXG: ...`, ...) at any
//! time, including in the middle of a command exchange. Callers register a
//! prefix, the number of lines that follow the indication line, and a
//! handler. The IO task feeds every received line through an
//! [`IndicationRouter`], which picks the longest registered prefix matching
//! the line, collects the trailing lines (possibly across several reads), and
//! then calls the handler with all `1 + trailing_lines` lines.
//!
//! The registration table is shared between the session handle and the IO
//! task. Handlers are always called with the table unlocked, so a handler
//! may register or unregister indications, or clone the session and spawn a
//! task that issues commands.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use tetra_core::error::{Error, Result};

/// Callback for a matched indication.
///
/// `lines` holds the indication line followed by its trailing lines.
/// Handlers run on the IO task: they must be fast and must never block on a
/// command exchange. Work that needs the session is handed off to a task.
///
/// Closures implement this trait:
///
/// ```
/// use tetra_pei::indication::IndicationHandler;
///
/// fn takes_handler(_: impl IndicationHandler) {}
/// takes_handler(|lines: &[String]| println!("{}", lines[0]));
/// ```
pub trait IndicationHandler: Send + Sync + 'static {
    fn on_match(&self, lines: &[String]);
}

impl<F> IndicationHandler for F
where
    F: Fn(&[String]) + Send + Sync + 'static,
{
    fn on_match(&self, lines: &[String]) {
        self(lines)
    }
}

#[derive(Clone)]
struct Entry {
    id: u64,
    prefix: String,
    trailing_lines: usize,
    handler: Arc<dyn IndicationHandler>,
    /// Cleared when the registration goes away. Checked right before the
    /// handler is invoked; a call that passed the check runs to completion.
    active: Arc<AtomicBool>,
}

impl Entry {
    fn invoke(&self, lines: &[String]) {
        if !self.active.load(Ordering::Acquire) {
            debug!(prefix = %self.prefix, "dropping indication for removed handler");
            return;
        }
        let handler = &self.handler;
        if catch_unwind(AssertUnwindSafe(|| handler.on_match(lines))).is_err() {
            warn!(prefix = %self.prefix, "indication handler panicked");
        }
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct TableInner {
    next_id: u64,
    entries: Vec<Entry>,
}

/// The set of registered indications, shared by all clones.
#[derive(Clone, Default)]
pub struct IndicationTable {
    inner: Arc<Mutex<TableInner>>,
}

impl IndicationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `handler` for lines starting with `prefix`.
    ///
    /// The registration lives as long as the returned guard, unless the
    /// guard is [detached](IndicationGuard::detach). A prefix can only be
    /// registered once at a time.
    pub fn register(
        &self,
        prefix: &str,
        trailing_lines: usize,
        handler: impl IndicationHandler,
    ) -> Result<IndicationGuard> {
        if prefix.is_empty() {
            return Err(Error::InvalidParameter(
                "indication prefix must not be empty".into(),
            ));
        }

        let mut inner = self.lock();
        if inner.entries.iter().any(|e| e.prefix == prefix) {
            return Err(Error::DuplicateIndication(prefix.to_string()));
        }

        inner.next_id += 1;
        let entry = Entry {
            id: inner.next_id,
            prefix: prefix.to_string(),
            trailing_lines,
            handler: Arc::new(handler),
            active: Arc::new(AtomicBool::new(true)),
        };
        let guard = IndicationGuard {
            table: Some(self.clone()),
            id: entry.id,
            active: Arc::clone(&entry.active),
        };
        debug!(prefix, trailing_lines, "indication registered");
        inner.entries.push(entry);
        Ok(guard)
    }

    /// Remove the registration for `prefix`. Returns whether there was one.
    pub fn unregister(&self, prefix: &str) -> bool {
        let mut inner = self.lock();
        let Some(pos) = inner.entries.iter().position(|e| e.prefix == prefix) else {
            return false;
        };
        let entry = inner.entries.remove(pos);
        entry.deactivate();
        debug!(prefix, "indication unregistered");
        true
    }

    fn remove_id(&self, id: u64) {
        let mut inner = self.lock();
        if let Some(pos) = inner.entries.iter().position(|e| e.id == id) {
            let entry = inner.entries.remove(pos);
            entry.deactivate();
            debug!(prefix = %entry.prefix, "indication unregistered");
        }
    }

    pub fn contains(&self, prefix: &str) -> bool {
        self.lock().entries.iter().any(|e| e.prefix == prefix)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every registration. Used when the session closes.
    pub fn clear(&self) {
        let mut inner = self.lock();
        for entry in inner.entries.drain(..) {
            entry.deactivate();
        }
    }

    fn longest_match(&self, line: &str) -> Option<Entry> {
        self.lock()
            .entries
            .iter()
            .filter(|e| line.starts_with(e.prefix.as_str()))
            .max_by_key(|e| e.prefix.len())
            .cloned()
    }
}

/// Keeps an indication registered. Dropping the guard unregisters it.
///
/// Once the drop returns, the router starts no new call of the handler, even
/// for an indication whose lines were already being collected. A call that
/// the IO task started before the drop may still be running, so a guard
/// dropped on another task can see one more call finish after the drop.
#[must_use = "dropping the guard unregisters the indication"]
pub struct IndicationGuard {
    table: Option<IndicationTable>,
    id: u64,
    active: Arc<AtomicBool>,
}

impl IndicationGuard {
    /// Keep the registration until it is removed explicitly or the session
    /// closes.
    pub fn detach(mut self) {
        self.table = None;
    }

    /// Whether the registration is still in place.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for IndicationGuard {
    fn drop(&mut self) {
        if let Some(table) = self.table.take() {
            table.remove_id(self.id);
        }
    }
}

impl std::fmt::Debug for IndicationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndicationGuard")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// An indication whose trailing lines have not all arrived yet.
struct Collecting {
    entry: Entry,
    lines: Vec<String>,
}

/// Per-stream dispatch state. Owned by the IO task.
pub struct IndicationRouter {
    table: IndicationTable,
    collecting: Option<Collecting>,
}

impl IndicationRouter {
    pub fn new(table: IndicationTable) -> Self {
        IndicationRouter {
            table,
            collecting: None,
        }
    }

    /// Whether the router is waiting for trailing lines of an indication.
    pub fn is_collecting(&self) -> bool {
        self.collecting.is_some()
    }

    /// Offer a line to the router. Returns `true` if the line was consumed,
    /// either as an indication line or as a trailing line.
    pub fn dispatch(&mut self, line: &str) -> bool {
        if let Some(mut collecting) = self.collecting.take() {
            collecting.lines.push(line.to_string());
            if collecting.lines.len() > collecting.entry.trailing_lines {
                collecting.entry.invoke(&collecting.lines);
            } else {
                self.collecting = Some(collecting);
            }
            return true;
        }

        let Some(entry) = self.table.longest_match(line) else {
            return false;
        };

        let lines = vec![line.to_string()];
        if entry.trailing_lines == 0 {
            entry.invoke(&lines);
        } else {
            self.collecting = Some(Collecting { entry, lines });
        }
        true
    }

    /// Drop a partially collected indication.
    pub fn reset(&mut self) {
        if let Some(collecting) = self.collecting.take() {
            debug!(
                prefix = %collecting.entry.prefix,
                collected = collecting.lines.len(),
                "discarding incomplete indication"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Calls = Arc<Mutex<Vec<Vec<String>>>>;

    fn recorder() -> (Calls, impl IndicationHandler) {
        let calls: Calls = Arc::default();
        let sink = Arc::clone(&calls);
        let handler = move |lines: &[String]| {
            sink.lock().unwrap().push(lines.to_vec());
        };
        (calls, handler)
    }

    #[test]
    fn longest_prefix_wins() {
        let table = IndicationTable::new();
        let (short_calls, short) = recorder();
        let (long_calls, long) = recorder();
        let _a = table.register("+CTSDSR:", 1, short).unwrap();
        let _b = table.register("+CTSDSR: 13,", 1, long).unwrap();

        let mut router = IndicationRouter::new(table);
        assert!(router.dispatch("+CTSDSR: 13,1234567,0,7654321,0,16"));
        assert!(router.dispatch("8002"));

        assert!(short_calls.lock().unwrap().is_empty());
        assert_eq!(long_calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn sibling_prefixes_are_deterministic() {
        let table = IndicationTable::new();
        let (calls_12, handler_12) = recorder();
        let (calls_13, handler_13) = recorder();
        let _a = table.register("+CTSDSR: 12,", 1, handler_12).unwrap();
        let _b = table.register("+CTSDSR: 13,", 1, handler_13).unwrap();

        let mut router = IndicationRouter::new(table);
        assert!(router.dispatch("+CTSDSR: 13,1234567,0,7654321,0,16"));
        assert!(router.is_collecting());
        assert!(router.dispatch("8002"));
        assert!(!router.is_collecting());
        // Not a trailing line any more, and no prefix matches.
        assert!(!router.dispatch("OK"));

        assert!(calls_12.lock().unwrap().is_empty());
        let calls = calls_13.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0],
            vec![
                "+CTSDSR: 13,1234567,0,7654321,0,16".to_string(),
                "8002".to_string()
            ]
        );
    }

    #[test]
    fn zero_trailing_lines_dispatch_immediately() {
        let table = IndicationTable::new();
        let (calls, handler) = recorder();
        let _g = table.register("+CTXG:", 0, handler).unwrap();

        let mut router = IndicationRouter::new(table);
        assert!(router.dispatch("+CTXG: 1,3,0,0"));
        assert!(!router.is_collecting());
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn unmatched_line_is_not_consumed() {
        let table = IndicationTable::new();
        let mut router = IndicationRouter::new(table);
        assert!(!router.dispatch("+CBC: 1,80"));
    }

    #[test]
    fn duplicate_prefix_is_rejected() {
        let table = IndicationTable::new();
        let _g = table.register("+CTCR:", 0, |_: &[String]| {}).unwrap();
        let err = table.register("+CTCR:", 0, |_: &[String]| {}).unwrap_err();
        assert!(matches!(err, Error::DuplicateIndication(p) if p == "+CTCR:"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn empty_prefix_is_rejected() {
        let table = IndicationTable::new();
        let err = table.register("", 0, |_: &[String]| {}).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn guard_drop_unregisters() {
        let table = IndicationTable::new();
        let guard = table.register("+CDTXC:", 0, |_: &[String]| {}).unwrap();
        assert!(table.contains("+CDTXC:"));
        assert!(guard.is_active());
        drop(guard);
        assert!(!table.contains("+CDTXC:"));

        // The prefix is free again.
        let _again = table.register("+CDTXC:", 0, |_: &[String]| {}).unwrap();
    }

    #[test]
    fn detached_guard_keeps_registration() {
        let table = IndicationTable::new();
        table
            .register("+CTOM: ", 0, |_: &[String]| {})
            .unwrap()
            .detach();
        assert!(table.contains("+CTOM: "));
        assert!(table.unregister("+CTOM: "));
        assert!(!table.unregister("+CTOM: "));
    }

    #[test]
    fn handler_removed_while_collecting_is_not_called() {
        let table = IndicationTable::new();
        let (calls, handler) = recorder();
        let guard = table.register("+CTSDSR: 12,", 1, handler).unwrap();

        let mut router = IndicationRouter::new(table);
        assert!(router.dispatch("+CTSDSR: 12,1234567,0,7654321,0,32"));
        drop(guard);
        // The trailing line is still swallowed, but nobody is called.
        assert!(router.dispatch("82100042"));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn panicking_handler_is_contained() {
        let table = IndicationTable::new();
        let _g = table
            .register("+CTCR:", 0, |_: &[String]| panic!("bad indication"))
            .unwrap();
        let (calls, handler) = recorder();
        let _h = table.register("+CTXG:", 0, handler).unwrap();

        let mut router = IndicationRouter::new(table);
        assert!(router.dispatch("+CTCR: 1,1"));
        assert!(router.dispatch("+CTXG: 1,3,0,0"));
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn handler_may_modify_table() {
        let table = IndicationTable::new();
        let inner = table.clone();
        let _g = table
            .register("+CTOM: ", 0, move |_: &[String]| {
                inner.unregister("+CTCR:");
            })
            .unwrap();
        table.register("+CTCR:", 0, |_: &[String]| {}).unwrap().detach();

        let mut router = IndicationRouter::new(table.clone());
        assert!(router.dispatch("+CTOM: 1"));
        assert!(!table.contains("+CTCR:"));
    }

    #[test]
    fn handler_may_remove_itself() {
        let table = IndicationTable::new();
        let inner = table.clone();
        let calls = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&calls);
        table
            .register("+CTXG:", 0, move |_: &[String]| {
                *sink.lock().unwrap() += 1;
                inner.unregister("+CTXG:");
            })
            .unwrap()
            .detach();

        let mut router = IndicationRouter::new(table.clone());
        assert!(router.dispatch("+CTXG: 1,3,0,0"));
        assert!(!router.dispatch("+CTXG: 1,3,0,0"));
        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn clear_deactivates_guards() {
        let table = IndicationTable::new();
        let guard = table.register("+CTXG:", 0, |_: &[String]| {}).unwrap();
        table.clear();
        assert!(table.is_empty());
        assert!(!guard.is_active());
    }

    #[test]
    fn reset_discards_partial_indication() {
        let table = IndicationTable::new();
        let (calls, handler) = recorder();
        let _g = table.register("+CTSDSR: 12,", 1, handler).unwrap();

        let mut router = IndicationRouter::new(table);
        router.dispatch("+CTSDSR: 12,1234567,0,7654321,0,32");
        router.reset();
        assert!(!router.is_collecting());
        assert!(!router.dispatch("OK"));
        assert!(calls.lock().unwrap().is_empty());
    }
}
