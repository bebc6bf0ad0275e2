//! Query routing between query nodes.
//!
//! Statement execution is supplied by the embedding application through
//! [`QueryBuilder`]. The resolver only decides where a query runs: reads run
//! on the receiving node, writes run on the primary through the database's
//! write queue, and replicas forward writes to the primary.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use litebase_proto::error::{LbError, LbResult};
use litebase_proto::message::NodeMessage;
use litebase_proto::query::{QueryInput, QueryResponse};
use tracing::debug;

use crate::write_queue::WriteQueueManager;

/// A prepared statement ready to run against its database.
#[async_trait]
pub trait Query: Send + Sync {
    fn is_write(&self) -> bool;

    /// Execute and fill in `response`.
    async fn resolve(&self, response: &mut QueryResponse) -> LbResult<()>;
}

pub trait QueryBuilder: Send + Sync {
    fn build(&self, input: &QueryInput) -> LbResult<Box<dyn Query>>;
}

/// Builder for nodes started without an execution engine; every query fails.
pub struct DetachedQueryBuilder;

impl QueryBuilder for DetachedQueryBuilder {
    fn build(&self, _input: &QueryInput) -> LbResult<Box<dyn Query>> {
        Err(LbError::QueryFailed)
    }
}

/// What the resolver needs from its node.
#[async_trait]
pub trait PrimaryForwarder: Send + Sync {
    fn is_primary(&self) -> bool;

    /// Send `msg` to the current primary over the primary route.
    async fn forward_to_primary(&self, msg: NodeMessage) -> LbResult<NodeMessage>;
}

pub struct QueryResolver {
    builder: Arc<dyn QueryBuilder>,
    queues: Arc<WriteQueueManager>,
}

async fn execute(query: Box<dyn Query>, id: String) -> LbResult<QueryResponse> {
    let start = Instant::now();
    let mut response = QueryResponse {
        id,
        ..Default::default()
    };
    query.resolve(&mut response).await?;
    response.latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    Ok(response)
}

impl QueryResolver {
    pub fn new(builder: Arc<dyn QueryBuilder>, queues: Arc<WriteQueueManager>) -> Self {
        Self { builder, queues }
    }

    pub fn queues(&self) -> &Arc<WriteQueueManager> {
        &self.queues
    }

    async fn execute_local(&self, input: &QueryInput, query: Box<dyn Query>) -> LbResult<QueryResponse> {
        if !query.is_write() {
            return execute(query, input.id.clone()).await;
        }
        let id = input.id.clone();
        self.queues
            .push(&input.database_key(), execute(query, id))
            .await
    }

    /// Run a client query received by this node.
    pub async fn resolve(
        &self,
        node: &dyn PrimaryForwarder,
        input: QueryInput,
    ) -> LbResult<QueryResponse> {
        let query = self.builder.build(&input)?;
        if !query.is_write() || node.is_primary() {
            return self.execute_local(&input, query).await;
        }

        debug!("query: forwarding {} to primary", input.id);
        match node.forward_to_primary(NodeMessage::Query(input)).await {
            Ok(NodeMessage::QueryResponse(response)) => Ok(response),
            Ok(_) => Err(LbError::UnknownMessage),
            Err(e) if e.is_transport() || e == LbError::NotPrimary => {
                Err(LbError::NoPrimaryAvailable)
            }
            Err(e) => Err(e),
        }
    }

    /// Run a query another node forwarded to this one as primary.
    pub async fn resolve_forwarded(
        &self,
        node: &dyn PrimaryForwarder,
        input: QueryInput,
    ) -> LbResult<QueryResponse> {
        if !node.is_primary() {
            return Err(LbError::NotPrimary);
        }
        let query = self.builder.build(&input)?;
        self.execute_local(&input, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Recorded {
        write: bool,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Query for Recorded {
        fn is_write(&self) -> bool {
            self.write
        }

        async fn resolve(&self, response: &mut QueryResponse) -> LbResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.write {
                response.changes = 1;
            }
            Ok(())
        }
    }

    struct Builder {
        runs: Arc<AtomicUsize>,
    }

    impl QueryBuilder for Builder {
        fn build(&self, input: &QueryInput) -> LbResult<Box<dyn Query>> {
            Ok(Box::new(Recorded {
                write: !input.statement.to_uppercase().starts_with("SELECT"),
                runs: self.runs.clone(),
            }))
        }
    }

    struct Forwarder {
        primary: AtomicBool,
        reply: Mutex<Option<LbResult<NodeMessage>>>,
        forwarded: AtomicUsize,
    }

    impl Forwarder {
        fn new(primary: bool, reply: LbResult<NodeMessage>) -> Self {
            Self {
                primary: AtomicBool::new(primary),
                reply: Mutex::new(Some(reply)),
                forwarded: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PrimaryForwarder for Forwarder {
        fn is_primary(&self) -> bool {
            self.primary.load(Ordering::SeqCst)
        }

        async fn forward_to_primary(&self, _msg: NodeMessage) -> LbResult<NodeMessage> {
            self.forwarded.fetch_add(1, Ordering::SeqCst);
            self.reply.lock().unwrap().take().unwrap_or(Err(LbError::NetworkError))
        }
    }

    fn resolver() -> (QueryResolver, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let queues = Arc::new(WriteQueueManager::new(
            10,
            Duration::from_secs(3),
            CancellationToken::new(),
        ));
        let builder = Arc::new(Builder { runs: runs.clone() });
        (QueryResolver::new(builder, queues), runs)
    }

    fn input(statement: &str) -> QueryInput {
        QueryInput {
            id: "q1".into(),
            access_key_id: "key".into(),
            database_hash: "hash".into(),
            database_id: "db1".into(),
            branch_id: "main".into(),
            statement: statement.into(),
            parameters: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_reads_run_locally_on_replica() {
        let (resolver, runs) = resolver();
        let node = Forwarder::new(false, Err(LbError::NetworkError));
        let response = resolver.resolve(&node, input("SELECT 1")).await.unwrap();
        assert_eq!(response.id, "q1");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(node.forwarded.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_primary_writes_go_through_queue() {
        let (resolver, runs) = resolver();
        let node = Forwarder::new(true, Err(LbError::NetworkError));
        let response = resolver.resolve(&node, input("INSERT INTO t VALUES (1)")).await.unwrap();
        assert_eq!(response.changes, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.queues().len(), 1);
    }

    #[tokio::test]
    async fn test_replica_forwards_writes() {
        let (resolver, runs) = resolver();
        let forwarded = QueryResponse {
            id: "q1".into(),
            changes: 3,
            ..Default::default()
        };
        let node = Forwarder::new(false, Ok(NodeMessage::QueryResponse(forwarded.clone())));
        let response = resolver.resolve(&node, input("DELETE FROM t")).await.unwrap();
        assert_eq!(response, forwarded);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unreachable_primary_maps_to_no_primary() {
        let (resolver, _) = resolver();
        for reply in [Err(LbError::NetworkError), Err(LbError::NotPrimary)] {
            let node = Forwarder::new(false, reply);
            assert_eq!(
                resolver.resolve(&node, input("UPDATE t SET a = 1")).await,
                Err(LbError::NoPrimaryAvailable)
            );
        }
    }

    #[tokio::test]
    async fn test_forwarded_query_requires_primary() {
        let (resolver, runs) = resolver();
        let replica = Forwarder::new(false, Err(LbError::NetworkError));
        assert_eq!(
            resolver.resolve_forwarded(&replica, input("INSERT INTO t VALUES (1)")).await,
            Err(LbError::NotPrimary)
        );
        let primary = Forwarder::new(true, Err(LbError::NetworkError));
        resolver
            .resolve_forwarded(&primary, input("INSERT INTO t VALUES (1)"))
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detached_builder_fails() {
        assert!(matches!(
            DetachedQueryBuilder.build(&input("SELECT 1")),
            Err(LbError::QueryFailed)
        ));
    }
}
