//! Deferred teardown in reverse registration order
//!
//! GPU objects must be destroyed in the reverse of the order they were created
//! in: a descriptor set before the pool that allocated it, a pipeline before its
//! layout, every per-frame object before the device. Creation code registers
//! one teardown action per object right after creating it, and `flush` replays
//! them backwards once the GPU is idle.
//!
//! Actions receive the context passed to `flush` (normally the device), so they
//! hold handles rather than borrowed device state.

use crate::error::{FrameError, FrameResult, GpuResult};

/// A single deferred teardown action
pub type DeferredAction<C> = Box<dyn FnOnce(&mut C) -> GpuResult<()>>;

/// LIFO registry of teardown actions
pub struct DeletionQueue<C: ?Sized> {
    actions: Vec<DeferredAction<C>>,
}

impl<C: ?Sized> DeletionQueue<C> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self { actions: Vec::new() }
    }

    /// Append a teardown action
    pub fn register<F>(&mut self, action: F)
    where
        F: FnOnce(&mut C) -> GpuResult<()> + 'static,
    {
        self.actions.push(Box::new(action));
    }

    /// Number of pending actions
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether no actions are pending
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every pending action, newest first, then clear the queue
    ///
    /// The caller must guarantee the GPU no longer references any of the
    /// resources (normally by waiting for the device to go idle first).
    ///
    /// A failing action stops the flush. The actions registered before it are
    /// discarded without running: a half torn-down device cannot be trusted,
    /// so the error is reported as fatal and nothing is retried. Flushing an
    /// empty queue does nothing.
    pub fn flush(&mut self, context: &mut C) -> FrameResult<()> {
        let pending = self.actions.len();
        if pending > 0 {
            log::debug!("Flushing deletion queue ({pending} actions)");
        }

        while let Some(action) = self.actions.pop() {
            let index = self.actions.len();
            if let Err(source) = action(context) {
                let abandoned = self.actions.len();
                self.actions.clear();
                log::error!(
                    "Teardown action #{index} failed: {source}; abandoning {abandoned} remaining actions"
                );
                return Err(FrameError::Teardown { index, source });
            }
        }
        Ok(())
    }
}

impl<C: ?Sized> Default for DeletionQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ?Sized> Drop for DeletionQueue<C> {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            log::warn!(
                "DeletionQueue dropped with {} unflushed actions; GPU objects leaked",
                self.actions.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GpuError;
    use ash::vk;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recorder() -> (Rc<RefCell<Vec<usize>>>, impl Fn(usize) -> Box<dyn FnOnce(&mut ()) -> GpuResult<()>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        let make = move |id: usize| {
            let sink = Rc::clone(&sink);
            Box::new(move |_: &mut ()| {
                sink.borrow_mut().push(id);
                Ok(())
            }) as Box<dyn FnOnce(&mut ()) -> GpuResult<()>>
        };
        (log, make)
    }

    #[test]
    fn test_flush_runs_in_reverse_order_exactly_once() {
        let (log, make) = recorder();
        let mut queue = DeletionQueue::new();
        for id in 0..5 {
            queue.register(make(id));
        }
        assert_eq!(queue.len(), 5);

        queue.flush(&mut ()).unwrap();
        assert_eq!(*log.borrow(), vec![4, 3, 2, 1, 0]);
        assert!(queue.is_empty());

        queue.flush(&mut ()).unwrap();
        assert_eq!(log.borrow().len(), 5);
    }

    #[test]
    fn test_register_after_flush_starts_fresh() {
        let (log, make) = recorder();
        let mut queue = DeletionQueue::new();
        queue.register(make(0));
        queue.flush(&mut ()).unwrap();
        queue.register(make(1));
        queue.register(make(2));
        queue.flush(&mut ()).unwrap();
        assert_eq!(*log.borrow(), vec![0, 2, 1]);
    }

    #[test]
    fn test_failure_abandons_remaining_actions() {
        let (log, make) = recorder();
        let mut queue = DeletionQueue::new();
        queue.register(make(0));
        queue.register(|_: &mut ()| Err(GpuError::Api(vk::Result::ERROR_DEVICE_LOST)));
        queue.register(make(2));

        let err = queue.flush(&mut ()).unwrap_err();
        assert!(matches!(err, FrameError::Teardown { index: 1, .. }));
        assert_eq!(*log.borrow(), vec![2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_actions_receive_context() {
        let mut queue: DeletionQueue<Vec<&'static str>> = DeletionQueue::new();
        queue.register(|destroyed: &mut Vec<&'static str>| {
            destroyed.push("pool");
            Ok(())
        });
        queue.register(|destroyed: &mut Vec<&'static str>| {
            destroyed.push("set");
            Ok(())
        });

        let mut destroyed = Vec::new();
        queue.flush(&mut destroyed).unwrap();
        assert_eq!(destroyed, vec!["set", "pool"]);
    }
}
