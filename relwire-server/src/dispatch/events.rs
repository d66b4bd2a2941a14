//! Event subscriptions delivered over the aux channel.
//!
//! A subscription fires at most once. Whoever flips its `claimed` flag
//! first wins: the engine callback sends the notification, a cancel
//! removes the engine subscription. The loser does nothing.

use super::{object_reply, ok_reply, Dispatcher};
use crate::error::ServerError;
use crate::port::{EventEntry, Port, PortState};
use relwire_engine::EventCallback;
use relwire_protocol::packet::{CancelEvents, Event, QueEvents};
use relwire_protocol::Packet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

impl Dispatcher {
    /// Drops handles of subscriptions that already fired.
    fn sweep_fired_events(state: &mut PortState) {
        for id in state.handles.events.ids() {
            let fired = state
                .handles
                .events
                .get(id)
                .is_ok_and(|e| e.claimed.load(Ordering::Acquire));
            if fired {
                let _ = state.handles.events.release(id);
            }
        }
    }

    fn find_event(state: &PortState, attachment: u32, local_id: u32) -> Option<u32> {
        state
            .handles
            .events
            .iter()
            .find(|(_, e)| e.attachment == attachment && e.local_id == local_id)
            .map(|(id, _)| id)
    }

    /// Releases a subscription, cancelling it in the engine unless it fired.
    fn drop_event(state: &mut PortState, id: u32) -> Result<(), ServerError> {
        let entry = state.handles.events.release(id)?;
        if !entry.claimed.swap(true, Ordering::AcqRel) {
            entry.engine.cancel_events(entry.subscription)?;
        }
        Ok(())
    }

    pub(super) fn que_events(
        &self,
        port: &Arc<Port>,
        state: &mut PortState,
        req: QueEvents,
    ) -> Result<Option<Packet>, ServerError> {
        if !port.has_aux() {
            return Err(ServerError::invalid(
                "events need an aux connection (send ConnectRequest first)",
            ));
        }
        let attachment = state.handles.attachments.get(req.attachment)?.engine.clone();
        Self::sweep_fired_events(state);
        if let Some(previous) = Self::find_event(state, req.attachment, req.local_id) {
            tracing::debug!("event id {} queued again, replacing", req.local_id);
            Self::drop_event(state, previous)?;
        }

        let claimed = Arc::new(AtomicBool::new(false));
        let callback: EventCallback = {
            let port = Arc::downgrade(port);
            let claimed = claimed.clone();
            let metrics = self.metrics.clone();
            let local_id = req.local_id;
            Box::new(move |events| {
                if claimed.swap(true, Ordering::AcqRel) {
                    return;
                }
                let Some(port) = port.upgrade() else {
                    return;
                };
                match port.send_aux(Packet::Event(Event { local_id, events })) {
                    Ok(()) => {
                        if let Some(metrics) = &metrics {
                            metrics.events_delivered_total.inc();
                        }
                    }
                    Err(e) => tracing::debug!("[{}] event {} not delivered: {}", port.id, local_id, e),
                }
            })
        };

        let subscription = attachment.que_events(&req.events, callback)?;
        match state.handles.events.allocate(EventEntry {
            engine: attachment.clone(),
            attachment: req.attachment,
            local_id: req.local_id,
            subscription,
            claimed: claimed.clone(),
        }) {
            Ok(id) => Ok(object_reply(id)),
            Err(e) => {
                if !claimed.swap(true, Ordering::AcqRel) {
                    let _ = attachment.cancel_events(subscription);
                }
                Err(e.into())
            }
        }
    }

    /// Always succeeds: cancelling a subscription that already fired, or
    /// one the client never queued, is not an error.
    pub(super) fn cancel_events(
        &self,
        state: &mut PortState,
        req: CancelEvents,
    ) -> Result<Option<Packet>, ServerError> {
        if let Some(id) = Self::find_event(state, req.attachment, req.local_id) {
            if let Err(e) = Self::drop_event(state, id) {
                tracing::debug!("cancelling event id {}: {}", req.local_id, e);
            }
        }
        Ok(ok_reply())
    }
}
