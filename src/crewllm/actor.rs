//! Actor runtime.
//!
//! An [`Actor`] is a named cooperative task that drains one inbox, message by
//! message. Control signals (interrupt, poison, budget updates) are handled
//! before any work accounting; everything else is gated on a positive budget
//! and then dispatched to the actor's [`WorkHandler`].
//!
//! The runtime deliberately knows nothing about agents or LLMs — the
//! specialization lives entirely in the handler, the way
//! [`AgentBehavior`](crate::crewllm::agent::AgentBehavior) plugs in the
//! think/act/observe loop.

use crate::crewllm::bus::{BusError, EventBus};
use crate::crewllm::message::{Envelope, Payload};
use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Error wrapper for an uncaught failure inside a work handler.
///
/// An `Err(WorkError)` returned from [`Actor::run`] is what the kernel's
/// reaper observes and turns into an `actor_crashed` publication.
#[derive(Debug)]
pub struct WorkError(pub String);

impl fmt::Display for WorkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for WorkError {}

/// The per-actor state shared with the work handler (and, via
/// [`ActorHandle`], with the kernel).
pub struct ActorContext {
    /// Unique actor name within the kernel table.
    pub name: String,
    /// The shared bus; handlers publish through this.
    pub bus: Arc<EventBus>,
    /// Name of the actor that supervises budget exhaustion and crashes.
    pub supervisor: String,
    budget: Arc<AtomicI64>,
}

impl ActorContext {
    /// Current work-credit balance.
    pub fn budget(&self) -> i64 {
        self.budget.load(Ordering::SeqCst)
    }

    /// Add a signed amount to the budget.
    pub fn add_budget(&self, amount: i64) {
        self.budget.fetch_add(amount, Ordering::SeqCst);
    }

    /// Consume one work credit. Call exactly once per reasoning step.
    pub fn consume_budget(&self) {
        self.budget.fetch_sub(1, Ordering::SeqCst);
    }

    /// Publish a payload addressed to another actor, stamped with this
    /// actor's name as origin.
    pub async fn send(&self, target: &str, payload: Payload, correlation_id: Option<String>) {
        self.bus
            .publish(
                Envelope::new(payload)
                    .from(self.name.clone())
                    .target(target)
                    .correlation_opt(correlation_id),
            )
            .await;
    }
}

/// Work dispatch seam implemented by actor specializations.
#[async_trait]
pub trait WorkHandler: Send {
    /// Handle one non-control message. An `Err` terminates the actor loop
    /// and is reported to the kernel as a crash.
    async fn on_work(&mut self, ctx: &ActorContext, msg: Envelope) -> Result<(), WorkError>;

    /// Hook invoked on an interrupt signal before the loop continues.
    ///
    /// The default implementation just logs; specializations can persist
    /// partial work here.
    async fn on_interrupt(&mut self, ctx: &ActorContext, reason: Option<&str>) {
        log::info!(
            "Actor '{}' interrupted{}",
            ctx.name,
            reason.map(|r| format!(": {}", r)).unwrap_or_default()
        );
    }
}

/// Cheap handle to a running actor, held by the kernel table.
#[derive(Clone)]
pub struct ActorHandle {
    pub name: String,
    sender: UnboundedSender<Envelope>,
    budget: Arc<AtomicI64>,
}

impl ActorHandle {
    /// Push a message straight onto the actor's inbox, bypassing the bus.
    ///
    /// Used by the kernel for control signals (interrupts, budget updates)
    /// that must reach the actor even when bus routing is not desired.
    pub fn push(&self, msg: Envelope) {
        if self.sender.send(msg).is_err() {
            log::warn!("Actor '{}': inbox closed, message dropped", self.name);
        }
    }

    /// Current budget as seen from outside the actor task.
    pub fn budget(&self) -> i64 {
        self.budget.load(Ordering::SeqCst)
    }
}

/// A named inbox-driven task. Generic over its [`WorkHandler`].
pub struct Actor<H: WorkHandler> {
    ctx: ActorContext,
    inbox: UnboundedReceiver<Envelope>,
    handler: H,
}

impl<H: WorkHandler> Actor<H> {
    /// Create an actor, register its inbox with the bus, and return it
    /// together with a handle for the kernel table.
    ///
    /// Fails if the name is already registered.
    pub async fn new(
        name: impl Into<String>,
        bus: Arc<EventBus>,
        supervisor: impl Into<String>,
        start_budget: i64,
        handler: H,
    ) -> Result<(Self, ActorHandle), BusError> {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        bus.register(name.clone(), tx.clone()).await?;

        let budget = Arc::new(AtomicI64::new(start_budget));
        let handle = ActorHandle {
            name: name.clone(),
            sender: tx,
            budget: Arc::clone(&budget),
        };
        let ctx = ActorContext {
            name,
            bus,
            supervisor: supervisor.into(),
            budget,
        };
        Ok((
            Self {
                ctx,
                inbox: rx,
                handler,
            },
            handle,
        ))
    }

    /// Main event loop. Runs until a poison message, inbox closure, or an
    /// uncaught handler failure.
    pub async fn run(mut self) -> Result<(), WorkError> {
        log::info!(
            "Actor '{}' started with budget {}",
            self.ctx.name,
            self.ctx.budget()
        );
        let result = self.event_loop().await;
        log::info!("Actor '{}' stopped", self.ctx.name);
        result
    }

    async fn event_loop(&mut self) -> Result<(), WorkError> {
        while let Some(msg) = self.inbox.recv().await {
            match &msg.payload {
                Payload::Interrupt { reason } => {
                    self.handler
                        .on_interrupt(&self.ctx, reason.as_deref())
                        .await;
                    continue;
                }
                Payload::Poison => {
                    log::info!("Actor '{}' received poison, stopping", self.ctx.name);
                    return Ok(());
                }
                Payload::BudgetUpdate { amount } => {
                    self.ctx.add_budget(*amount);
                    log::info!(
                        "Actor '{}' budget updated, now {}",
                        self.ctx.name,
                        self.ctx.budget()
                    );
                    continue;
                }
                _ => {}
            }

            if self.ctx.budget() <= 0 {
                log::warn!(
                    "Actor '{}' budget exhausted, refusing {}",
                    self.ctx.name,
                    msg.payload.kind()
                );
                let supervisor = self.ctx.supervisor.clone();
                self.ctx
                    .send(
                        &supervisor,
                        Payload::BudgetExhausted {
                            content: "I have run out of budget. Please allocate more.".into(),
                        },
                        msg.correlation_id.clone(),
                    )
                    .await;
                if let Some(sender) = msg.from.as_deref() {
                    self.ctx
                        .send(
                            sender,
                            Payload::WorkFailed {
                                error: "BudgetExhausted".into(),
                            },
                            msg.correlation_id.clone(),
                        )
                        .await;
                }
                continue;
            }

            self.handler.on_work(&self.ctx, msg).await?;
        }
        Ok(())
    }
}
