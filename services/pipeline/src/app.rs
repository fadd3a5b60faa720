//! Wires the pipeline together: scoped stores, change log, dispatcher,
//! derived counters, stream gateway, replication listener, replay command.

use anyhow::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;

use stratum_activity::{
    ActivityBus, ActivityCounters, DeadLetterReplayer, DeadLetterStore, MemoryDeadLetterStore,
    PgDeadLetterStore,
};
use stratum_cdc::{ChangeLog, ChangeOp, Lsn, MemoryChangeLog, ReplicationListener};
use stratum_rls::{MemoryStore, MembershipStore, PgScopedStore, ScopedStore};
use stratum_stream::StreamGateway;

use crate::config::PipelineConfig;

/// All long-lived pipeline components, ready to serve.
pub struct Pipeline {
    pub store: Arc<dyn ScopedStore>,
    pub memberships: Arc<dyn MembershipStore>,
    pub log: Arc<MemoryChangeLog>,
    pub bus: Arc<ActivityBus>,
    pub counters: Arc<ActivityCounters>,
    pub gateway: Arc<StreamGateway>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub listener: Arc<ReplicationListener<MemoryChangeLog, ActivityBus>>,
    pub replayer: Arc<DeadLetterReplayer<MemoryChangeLog>>,
}

impl Pipeline {
    /// Build every component from config. With a database URL the scoped
    /// store and dead letters are durable; otherwise everything is
    /// in-memory, which is what tests and local development use.
    pub async fn build(config: &PipelineConfig) -> Result<Self> {
        let limits = config.limits();

        let (store, memberships, dead_letters): (
            Arc<dyn ScopedStore>,
            Arc<dyn MembershipStore>,
            Arc<dyn DeadLetterStore>,
        ) = match &config.database_url {
            Some(url) => {
                tracing::info!("using postgres-backed stores");
                let scoped = Arc::new(PgScopedStore::connect(url).await?);
                let dead = Arc::new(PgDeadLetterStore::connect(url).await?);
                (Arc::clone(&scoped) as _, scoped as _, dead as _)
            }
            None => {
                tracing::info!("using in-memory stores");
                let scoped = Arc::new(MemoryStore::new());
                let dead = Arc::new(MemoryDeadLetterStore::new());
                (Arc::clone(&scoped) as _, scoped as _, dead as _)
            }
        };

        let log = Arc::new(MemoryChangeLog::with_capacity(limits.log_capacity));
        let bus = Arc::new(ActivityBus::new(
            Arc::clone(&dead_letters),
            config.retry_policy(),
        ));
        let counters = Arc::new(ActivityCounters::new());
        let gateway = StreamGateway::new(&limits);
        bus.subscribe(Arc::clone(&counters) as _);
        bus.subscribe(Arc::clone(&gateway) as _);

        let listener = Arc::new(ReplicationListener::new(
            Arc::clone(&log),
            Arc::clone(&bus),
            limits.dispatch_batch_size,
        ));
        let replayer = Arc::new(DeadLetterReplayer::new(
            Arc::clone(&log),
            Arc::clone(&bus),
            Arc::clone(&dead_letters),
        ));

        Ok(Self {
            store,
            memberships,
            log,
            bus,
            counters,
            gateway,
            dead_letters,
            listener,
            replayer,
        })
    }

    /// Run the replication listener until shutdown.
    pub fn spawn_listener(&self) -> JoinHandle<stratum_cdc::Result<()>> {
        let listener = Arc::clone(&self.listener);
        tokio::spawn(async move { listener.run().await })
    }

    /// Record a change into the log (the write-side hook route handlers use
    /// after a committed mutation).
    pub async fn record_change(
        &self,
        table: &str,
        op: ChangeOp,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> Lsn {
        self.log.append(table, op, before, after).await
    }
}
