//! This module provides the [`StateMachine`]'s `Events`, `EventSubscriber` and `EventPublisher`
//! types.
//!
//! [`StateMachine`]: crate::state_machine::StateMachine

use std::sync::Arc;

use tokio::sync::watch;

use crate::{
    silo::SiloEvaluation,
    state_machine::{coordinator::Outcome, phases::PhaseName},
};
use uefl_core::{Model, RoundParameters};

/// An event emitted by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<E> {
    /// Metadata that associates this event to the round in which it is
    /// emitted.
    pub round_id: u64,
    /// The event itself
    pub event: E,
}

/// Global model update event.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelUpdate {
    Invalidate,
    New(Arc<Model>),
}

/// Silo evaluation update event.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationUpdate {
    Invalidate,
    New(Arc<Vec<SiloEvaluation>>),
}

/// A convenience type to emit any coordinator event.
#[derive(Debug)]
pub struct EventPublisher {
    /// Round ID that is attached to all the events.
    round_id: u64,
    params_tx: EventBroadcaster<RoundParameters>,
    phase_tx: EventBroadcaster<PhaseName>,
    model_tx: EventBroadcaster<ModelUpdate>,
    evaluations_tx: EventBroadcaster<EvaluationUpdate>,
    outcome_tx: EventBroadcaster<Outcome>,
}

/// The `EventSubscriber` hands out `EventListener`s for any
/// coordinator event.
#[derive(Debug)]
pub struct EventSubscriber {
    params_rx: EventListener<RoundParameters>,
    phase_rx: EventListener<PhaseName>,
    model_rx: EventListener<ModelUpdate>,
    evaluations_rx: EventListener<EvaluationUpdate>,
    outcome_rx: EventListener<Outcome>,
}

impl EventPublisher {
    /// Initialize a new event publisher with the given initial events.
    pub fn init(
        round_id: u64,
        params: RoundParameters,
        phase: PhaseName,
        model: ModelUpdate,
    ) -> (Self, EventSubscriber) {
        let (params_tx, params_rx) = watch::channel::<Event<RoundParameters>>(Event {
            round_id,
            event: params,
        });

        let (phase_tx, phase_rx) = watch::channel::<Event<PhaseName>>(Event {
            round_id,
            event: phase,
        });

        let (model_tx, model_rx) = watch::channel::<Event<ModelUpdate>>(Event {
            round_id,
            event: model,
        });

        let (evaluations_tx, evaluations_rx) = watch::channel::<Event<EvaluationUpdate>>(Event {
            round_id,
            event: EvaluationUpdate::Invalidate,
        });

        let (outcome_tx, outcome_rx) = watch::channel::<Event<Outcome>>(Event {
            round_id,
            event: Outcome::Running,
        });

        let publisher = EventPublisher {
            round_id,
            params_tx: params_tx.into(),
            phase_tx: phase_tx.into(),
            model_tx: model_tx.into(),
            evaluations_tx: evaluations_tx.into(),
            outcome_tx: outcome_tx.into(),
        };

        let subscriber = EventSubscriber {
            params_rx: params_rx.into(),
            phase_rx: phase_rx.into(),
            model_rx: model_rx.into(),
            evaluations_rx: evaluations_rx.into(),
            outcome_rx: outcome_rx.into(),
        };

        (publisher, subscriber)
    }

    /// Set the round ID that is attached to the events the publisher broadcasts.
    pub fn set_round_id(&mut self, id: u64) {
        self.round_id = id;
    }

    fn event<T>(&self, event: T) -> Event<T> {
        Event {
            round_id: self.round_id,
            event,
        }
    }

    /// Emit a round parameters event
    pub fn broadcast_params(&mut self, params: RoundParameters) {
        self.params_tx.broadcast(self.event(params));
    }

    /// Emit a phase event
    pub fn broadcast_phase(&mut self, phase: PhaseName) {
        self.phase_tx.broadcast(self.event(phase));
    }

    /// Emit a model event
    pub fn broadcast_model(&mut self, update: ModelUpdate) {
        self.model_tx.broadcast(self.event(update));
    }

    /// Emit a silo evaluation event
    pub fn broadcast_evaluations(&mut self, update: EvaluationUpdate) {
        self.evaluations_tx.broadcast(self.event(update));
    }

    /// Emit an outcome event
    pub fn broadcast_outcome(&mut self, outcome: Outcome) {
        self.outcome_tx.broadcast(self.event(outcome));
    }
}

impl EventSubscriber {
    /// Get a listener for round parameters events
    pub fn params_listener(&self) -> EventListener<RoundParameters> {
        self.params_rx.clone()
    }

    /// Get a listener for new phase events
    pub fn phase_listener(&self) -> EventListener<PhaseName> {
        self.phase_rx.clone()
    }

    /// Get a listener for new model events
    pub fn model_listener(&self) -> EventListener<ModelUpdate> {
        self.model_rx.clone()
    }

    /// Get a listener for silo evaluation events
    pub fn evaluations_listener(&self) -> EventListener<EvaluationUpdate> {
        self.evaluations_rx.clone()
    }

    /// Get a listener for the outcome of the run
    pub fn outcome_listener(&self) -> EventListener<Outcome> {
        self.outcome_rx.clone()
    }
}

/// A listener for coordinator events. It can be used to either
/// retrieve the latest `Event<E>` emitted by the coordinator (with
/// `EventListener::get_latest`) or to wait for the next one (with
/// `EventListener::next`).
#[derive(Debug, Clone)]
pub struct EventListener<E>(watch::Receiver<Event<E>>);

impl<E> From<watch::Receiver<Event<E>>> for EventListener<E> {
    fn from(receiver: watch::Receiver<Event<E>>) -> Self {
        EventListener(receiver)
    }
}

impl<E> EventListener<E>
where
    E: Clone,
{
    pub fn get_latest(&self) -> Event<E> {
        self.0.borrow().clone()
    }

    /// Waits for an event that hasn't been seen yet.
    ///
    /// Returns `None` once the publisher is gone.
    pub async fn next(&mut self) -> Option<Event<E>> {
        self.0.changed().await.ok()?;
        Some(self.0.borrow().clone())
    }
}

/// A channel to send `Event<E>` to all the `EventListener<E>`.
#[derive(Debug)]
pub struct EventBroadcaster<E>(watch::Sender<Event<E>>);

impl<E> EventBroadcaster<E> {
    /// Send `event` to all the `EventListener<E>`
    fn broadcast(&self, event: Event<E>) {
        // We don't care whether there's a listener or not
        let _ = self.0.send(event);
    }
}

impl<E> From<watch::Sender<Event<E>>> for EventBroadcaster<E> {
    fn from(sender: watch::Sender<Event<E>>) -> Self {
        Self(sender)
    }
}
