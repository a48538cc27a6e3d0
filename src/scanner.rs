use crate::document::{DocumentError, HostDocument, MutationBatch, has_attr, matches};
use crate::processor::{PROCESSED_ATTR, SlotOutcome};
use kuchiki::{NodeRef, Selectors};
use std::cell::Cell;
use std::rc::Rc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::debug;

/// Receiver of discovered slots. Idempotence is the receiver's job.
pub trait SlotHandoff {
    fn hand_off(&self, slot: NodeRef) -> SlotOutcome;
}

pub struct SlotScanner {
    document: HostDocument,
    selector: String,
    selectors: Selectors,
    scan_runs: Cell<usize>,
    handoff: Rc<dyn SlotHandoff>,
}

impl SlotScanner {
    pub fn new(
        document: HostDocument,
        selector: &str,
        handoff: Rc<dyn SlotHandoff>,
    ) -> Result<Self, DocumentError> {
        let selectors =
            Selectors::compile(selector).map_err(|()| DocumentError::Selector(selector.to_string()))?;
        Ok(Self {
            document,
            selector: selector.to_string(),
            selectors,
            scan_runs: Cell::new(0),
            handoff,
        })
    }

    /// Hands every unmarked matching element to the processor and returns
    /// how many of them started loading.
    pub fn scan_existing(&self) -> Result<usize, DocumentError> {
        self.scan_runs.set(self.scan_runs.get() + 1);
        let mut started = 0;
        for slot in self.document.select_all(&self.selector)? {
            if has_attr(&slot, PROCESSED_ATTR) {
                continue;
            }
            if let SlotOutcome::Loading(_) = self.handoff.hand_off(slot) {
                started += 1;
            }
        }
        debug!(selector = %self.selector, started, "scanned document for slots");
        Ok(started)
    }

    pub fn scan_runs(&self) -> usize {
        self.scan_runs.get()
    }

    /// Subscribes before returning, so insertions made right after this call
    /// are not missed even though the loop itself runs later.
    pub fn observe(self: &Rc<Self>) -> JoinHandle<()> {
        let mut batches = self.document.observe();
        let scanner = Rc::clone(self);
        tokio::task::spawn_local(async move {
            while let Some(batch) = batches.next().await {
                scanner.handle_batch(&batch);
            }
        })
    }

    pub fn handle_batch(&self, batch: &MutationBatch) {
        for node in &batch.added {
            if node.as_element().is_none() || !self.document.contains(node) {
                continue;
            }
            // The added node itself first, then any slots nested inside it.
            let candidates: Vec<NodeRef> = node
                .inclusive_descendants()
                .filter(|candidate| matches(candidate, &self.selectors))
                .collect();
            for slot in candidates {
                self.handoff.hand_off(slot);
            }
        }
    }
}
