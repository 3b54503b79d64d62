use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn, Instrument};

use super::connector::ExecutionReport;
use super::factory::ConnectorFactory;
use crate::bus::Queue;
use crate::coordination::ShutdownSignal;
use crate::domain::TradeCommand;
use crate::error::Result;
use crate::services::Metrics;

/// Settles trade commands against broker connectors
pub struct ExecutionWorker {
    factory: Arc<ConnectorFactory>,
    metrics: Arc<Metrics>,
    max_in_flight: usize,
}

impl ExecutionWorker {
    pub fn new(
        factory: Arc<ConnectorFactory>,
        metrics: Arc<Metrics>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            factory,
            metrics,
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Execute one command and count its outcome
    pub async fn execute_command(&self, command: &TradeCommand) -> Result<ExecutionReport> {
        let outcome = async {
            let connector = self.factory.get_connector(command.broker_connection_id).await?;
            connector.execute(command).await
        }
        .await;

        match &outcome {
            Ok(report) => {
                Metrics::inc(&self.metrics.orders_accepted);
                info!(
                    deal_reference = %report.deal_reference,
                    deal_id = report.deal_id.as_deref().unwrap_or("-"),
                    instrument = %report.instrument,
                    "order accepted"
                );
            }
            Err(e) if e.is_broker_rejection() => {
                Metrics::inc(&self.metrics.orders_rejected);
                warn!(error = %e, "order rejected by broker");
            }
            Err(e) if e.is_confirmation_timeout() => {
                Metrics::inc(&self.metrics.orders_timed_out);
                error!(error = %e, "order outcome unknown, reconcile with broker");
            }
            Err(e) => {
                Metrics::inc(&self.metrics.orders_failed);
                error!(error = %e, "order execution failed");
            }
        }
        outcome
    }

    /// Consume commands until shutdown, then wait for in-flight orders
    pub async fn run(self: Arc<Self>, commands: Queue<TradeCommand>, mut shutdown: ShutdownSignal) {
        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let mut in_flight = JoinSet::new();
        info!(max_in_flight = self.max_in_flight, "execution worker started");

        loop {
            let command = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = done {
                        error!(error = %e, "execution task panicked");
                    }
                    continue;
                }
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let span = tracing::info_span!(
                "execute",
                tenant = %command.tenant_id,
                broker_connection = %command.broker_connection_id,
                correlation_id = %command.correlation_id,
                symbol = %command.symbol,
            );
            let worker = Arc::clone(&self);
            in_flight.spawn(
                async move {
                    let _permit = permit;
                    let _ = worker.execute_command(&command).await;
                }
                .instrument(span),
            );
        }

        if !in_flight.is_empty() {
            info!(pending = in_flight.len(), "waiting for in-flight orders");
        }
        while let Some(done) = in_flight.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "execution task panicked");
            }
        }
        info!("execution worker stopped");
    }
}
