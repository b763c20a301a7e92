//! Long-lived invoice and payment subscriptions.
//!
//! Each feed resumes after the last index the store holds, services updates
//! until the stream ends or errors, then waits out a backoff and starts over.
//! Errors inside one update are logged and skipped; only stream-level
//! failures count towards the backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use lnchat_lib::client::{InvoiceFilter, PaymentFilter};
use lnchat_lib::{ErrorKind, LnchatError, Result};

use crate::backoff::Backoff;
use crate::service::MessageService;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Feed {
    Invoices,
    Payments,
}

impl std::fmt::Display for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Feed::Invoices => "invoices",
            Feed::Payments => "payments",
        })
    }
}

/// How one subscription cycle ended.
#[derive(Debug)]
enum Cycle {
    Killed,
    /// The remote closed the stream without error.
    Closed,
}

/// Owns the two subscription loops.
pub struct Supervisor {
    service: Arc<MessageService>,
    kill: watch::Sender<bool>,
    invoices: JoinHandle<()>,
    payments: JoinHandle<()>,
}

impl Supervisor {
    /// Spawn both feeds. Must be called within a tokio runtime.
    pub fn init(service: Arc<MessageService>) -> Self {
        let (kill, _) = watch::channel(false);
        let invoices = tokio::spawn(run_feed(
            Feed::Invoices,
            Arc::clone(&service),
            kill.subscribe(),
        ));
        let payments = tokio::spawn(run_feed(
            Feed::Payments,
            Arc::clone(&service),
            kill.subscribe(),
        ));
        info!("supervisor started");
        Self {
            service,
            kill,
            invoices,
            payments,
        }
    }

    pub fn service(&self) -> &Arc<MessageService> {
        &self.service
    }

    pub fn is_finished(&self) -> bool {
        self.invoices.is_finished() && self.payments.is_finished()
    }

    /// Handles for a hard stop that outlive [`Supervisor::shutdown`].
    pub fn abort_handles(&self) -> [AbortHandle; 2] {
        [self.invoices.abort_handle(), self.payments.abort_handle()]
    }

    /// Stop both feeds immediately.
    pub fn abort(&self) {
        for handle in self.abort_handles() {
            handle.abort();
        }
    }

    /// Two-phase stop: signal the loops, close the bus and the channel
    /// client, then wait up to `grace` for the loops to return. On expiry the
    /// loops are aborted. Every step runs; failures are logged and returned
    /// joined.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(self, grace: Duration) -> Result<()> {
        let Supervisor {
            service,
            kill,
            invoices,
            payments,
        } = self;
        let mut errors = Vec::new();

        // No receivers means both loops already returned.
        let _ = kill.send(true);
        service.bus().close();
        if let Err(e) = service.client().close().await {
            warn!(error = %e, "closing channel client failed");
            errors.push(e);
        }

        let aborts = [invoices.abort_handle(), payments.abort_handle()];
        let joined =
            tokio::time::timeout(grace, async move { tokio::join!(invoices, payments) }).await;
        match joined {
            Ok((invoices, payments)) => {
                for (feed, result) in [(Feed::Invoices, invoices), (Feed::Payments, payments)] {
                    if let Err(e) = result {
                        if !e.is_cancelled() {
                            warn!(%feed, error = %e, "feed task failed");
                            errors.push(LnchatError::internal(format!("{} feed: {}", feed, e)));
                        }
                    }
                }
            }
            Err(_) => {
                warn!(?grace, "graceful shutdown timed out, aborting feeds");
                for handle in aborts {
                    handle.abort();
                }
                errors.push(LnchatError::new(
                    ErrorKind::DeadlineExceeded,
                    format!("feeds still running after {:?}", grace),
                ));
            }
        }

        info!("supervisor stopped");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(LnchatError::join(errors))
        }
    }
}

#[tracing::instrument(skip(service, kill))]
async fn run_feed(feed: Feed, service: Arc<MessageService>, mut kill: watch::Receiver<bool>) {
    let mut backoff = Backoff::new();
    loop {
        if *kill.borrow() {
            break;
        }
        let cycle = match feed {
            Feed::Invoices => invoice_cycle(&service, &mut kill, &mut backoff).await,
            Feed::Payments => payment_cycle(&service, &mut kill, &mut backoff).await,
        };
        let delay = match cycle {
            Ok(Cycle::Killed) => break,
            Ok(Cycle::Closed) => {
                info!("subscription closed by remote");
                backoff.reset();
                backoff.next_delay()
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(error = %e, failures = backoff.failures(), ?delay, "subscription failed");
                delay
            }
        };

        tokio::select! {
            _ = kill.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!("feed stopped");
}

async fn invoice_cycle(
    service: &MessageService,
    kill: &mut watch::Receiver<bool>,
    backoff: &mut Backoff,
) -> Result<Cycle> {
    let last = service.store().get_last_settle_index().await?;
    let mut updates = service
        .client()
        .subscribe_invoice_updates(last, InvoiceFilter::resolved())
        .await?;
    info!(settle_index = last, "invoice subscription open");

    loop {
        tokio::select! {
            _ = kill.changed() => return Ok(Cycle::Killed),
            update = updates.recv() => match update {
                None => return Ok(Cycle::Closed),
                Some(Err(e)) => return Err(e),
                Some(Ok(invoice)) => {
                    backoff.reset();
                    let settle_index = invoice.settle_index;
                    if let Err(e) = service.handle_invoice(invoice).await {
                        warn!(settle_index, error = %e, "invoice update dropped");
                    }
                }
            }
        }
    }
}

async fn payment_cycle(
    service: &MessageService,
    kill: &mut watch::Receiver<bool>,
    backoff: &mut Backoff,
) -> Result<Cycle> {
    let last = service.store().get_last_payment_index().await?;
    let mut updates = service
        .client()
        .subscribe_payment_updates(last, PaymentFilter::resolved())
        .await?;
    info!(payment_index = last, "payment subscription open");

    loop {
        tokio::select! {
            _ = kill.changed() => return Ok(Cycle::Killed),
            update = updates.recv() => match update {
                None => return Ok(Cycle::Closed),
                Some(Err(e)) => return Err(e),
                Some(Ok(payment)) => {
                    backoff.reset();
                    let payment_index = payment.payment_index;
                    if let Err(e) = service.handle_payment(payment).await {
                        warn!(payment_index, error = %e, "payment update dropped");
                    }
                }
            }
        }
    }
}
