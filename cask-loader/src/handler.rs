use crate::task::{LoadOutcome, Loaded, RequestId, TaskKey};
use crate::{AssetInstance, InstanceId, LoadError, LoadResult};
use crossbeam_channel::{Receiver, Sender};
use slotmap::SlotMap;

slotmap::new_key_type! {
    pub struct HandlerKey;
}

/// Caller-facing token for one request. Stays valid until released, after which every call made
/// with it returns [`LoadError::InvalidHandler`] (the generation in the key no longer matches).
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Handler(pub(crate) HandlerKey);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum HandlerState {
    Doing,
    Success,
    Failed,
    Invalid,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum HandlerKind {
    Asset,
    Scene,
    Bundle,
    Download,
}

pub type CompletionCallback = Box<dyn FnOnce(&LoadOutcome)>;

struct HandlerSlot {
    kind: HandlerKind,
    name: String,
    state: HandlerState,
    outcome: Option<LoadOutcome>,
    task: Option<(TaskKey, RequestId)>,
    callbacks: Vec<CompletionCallback>,
    senders: Vec<Sender<LoadOutcome>>,
}

/// Pool of handler slots. Failed handlers release themselves once the update after the one they
/// failed in has finished, successful ones stay until the caller releases or unloads them.
#[derive(Default)]
pub struct HandlerPool {
    slots: SlotMap<HandlerKey, HandlerSlot>,
    completed_updates: u64,
    // (handler, release once completed_updates exceeds this)
    expiring: Vec<(HandlerKey, u64)>,
}

impl HandlerPool {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn create(
        &mut self,
        kind: HandlerKind,
        name: &str,
    ) -> Handler {
        Handler(self.slots.insert(HandlerSlot {
            kind,
            name: name.to_string(),
            state: HandlerState::Doing,
            outcome: None,
            task: None,
            callbacks: Vec::default(),
            senders: Vec::default(),
        }))
    }

    pub fn attach_task(
        &mut self,
        handler: Handler,
        task: TaskKey,
        request: RequestId,
    ) {
        if let Some(slot) = self.slots.get_mut(handler.0) {
            slot.task = Some((task, request));
        }
    }

    pub fn contains(
        &self,
        handler: Handler,
    ) -> bool {
        self.slots.contains_key(handler.0)
    }

    pub fn state(
        &self,
        handler: Handler,
    ) -> HandlerState {
        self.slots
            .get(handler.0)
            .map(|x| x.state)
            .unwrap_or(HandlerState::Invalid)
    }

    pub fn kind(
        &self,
        handler: Handler,
    ) -> LoadResult<HandlerKind> {
        self.slots
            .get(handler.0)
            .map(|x| x.kind)
            .ok_or(LoadError::InvalidHandler)
    }

    pub fn name(
        &self,
        handler: Handler,
    ) -> LoadResult<&str> {
        self.slots
            .get(handler.0)
            .map(|x| x.name.as_str())
            .ok_or(LoadError::InvalidHandler)
    }

    pub fn task(
        &self,
        handler: Handler,
    ) -> Option<(TaskKey, RequestId)> {
        self.slots.get(handler.0).and_then(|x| x.task)
    }

    pub fn outcome(
        &self,
        handler: Handler,
    ) -> Option<&LoadOutcome> {
        self.slots.get(handler.0).and_then(|x| x.outcome.as_ref())
    }

    pub fn instance(
        &self,
        handler: Handler,
    ) -> Option<AssetInstance> {
        match self.outcome(handler) {
            Some(Ok(Loaded::Asset(instance))) => Some(instance.clone()),
            _ => None,
        }
    }

    /// Successful handler whose outcome is this instance, if one is still held
    pub fn find_instance_holder(
        &self,
        instance: InstanceId,
    ) -> Option<Handler> {
        self.slots
            .iter()
            .find(|(_, slot)| match &slot.outcome {
                Some(Ok(Loaded::Asset(held))) => held.id() == instance,
                _ => false,
            })
            .map(|(key, _)| Handler(key))
    }

    pub fn error(
        &self,
        handler: Handler,
    ) -> Option<LoadError> {
        match self.outcome(handler) {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// Stores the outcome and fires callbacks and channels. Returns false if the handler was
    /// released before the outcome arrived or was already resolved.
    pub fn resolve(
        &mut self,
        handler: Handler,
        outcome: LoadOutcome,
    ) -> bool {
        let slot = match self.slots.get_mut(handler.0) {
            Some(slot) if slot.state == HandlerState::Doing => slot,
            _ => return false,
        };

        slot.state = if outcome.is_ok() {
            HandlerState::Success
        } else {
            HandlerState::Failed
        };
        slot.task = None;

        for sender in slot.senders.drain(..) {
            let _ = sender.try_send(outcome.clone());
        }
        let callbacks = std::mem::take(&mut slot.callbacks);
        slot.outcome = Some(outcome);

        if slot.state == HandlerState::Failed {
            self.expiring.push((handler.0, self.completed_updates));
        }

        if let Some(outcome) = self.slots.get(handler.0).and_then(|x| x.outcome.as_ref()) {
            for callback in callbacks {
                callback(outcome);
            }
        }
        true
    }

    /// Runs `callback` when the handler resolves, or right away if it already has
    pub fn on_complete(
        &mut self,
        handler: Handler,
        callback: CompletionCallback,
    ) -> LoadResult<()> {
        let slot = self
            .slots
            .get_mut(handler.0)
            .ok_or(LoadError::InvalidHandler)?;
        match &slot.outcome {
            Some(outcome) => callback(outcome),
            None => slot.callbacks.push(callback),
        }
        Ok(())
    }

    /// Single-shot channel receiving the outcome, already filled if the handler has resolved
    pub fn completion(
        &mut self,
        handler: Handler,
    ) -> LoadResult<Receiver<LoadOutcome>> {
        let slot = self
            .slots
            .get_mut(handler.0)
            .ok_or(LoadError::InvalidHandler)?;
        let (tx, rx) = crossbeam_channel::bounded(1);
        match &slot.outcome {
            Some(outcome) => {
                let _ = tx.try_send(outcome.clone());
            }
            None => slot.senders.push(tx),
        }
        Ok(rx)
    }

    pub fn release(
        &mut self,
        handler: Handler,
    ) -> LoadResult<()> {
        self.slots
            .remove(handler.0)
            .map(|_| ())
            .ok_or(LoadError::InvalidHandler)
    }

    /// Called at the end of every manager update
    pub fn end_update(&mut self) {
        self.completed_updates += 1;
        let completed_updates = self.completed_updates;
        let slots = &mut self.slots;
        self.expiring.retain(|(key, failed_at)| {
            if completed_updates > failed_at + 1 {
                slots.remove(*key);
                false
            } else {
                true
            }
        });
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.expiring.clear();
    }
}
