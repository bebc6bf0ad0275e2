//! Primary election.
//!
//! Every strategy starts from the shared nomination record
//! (`_cluster/<type>/NOMINATION`), one `address timestamp` line per
//! candidate. The earliest live entry wins and equal timestamps go to the
//! smallest address, so all nodes reading the same record agree on one
//! candidate. Entries older than the nomination TTL are ignored, which keeps
//! a crashed candidate from blocking later elections.
//!
//! [`NominationElection`] accepts the record's verdict directly.
//! [`ConfirmationElection`] additionally asks a small odd voter set to
//! confirm the candidate over the `Election` route.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use litebase_core::clock::{now_millis, now_nanos};
use litebase_core::connection_pool::ConnectionPool;
use litebase_core::file_store::FileSystem;
use litebase_proto::constants::{ELECTION_MAX_VOTERS, NOMINATION_FILE};
use litebase_proto::error::{LbError, LbResult};
use litebase_proto::message::{ConnectionRoute, ElectionRequest, NodeMessage};
use litebase_proto::node::{NodeAddress, NodeType};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ElectionKind;
use crate::lease::{cluster_file, Lease};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nomination {
    pub address: NodeAddress,
    /// Unix ns.
    pub timestamp: u64,
}

/// The candidate that wins among `entries`.
pub fn earliest(entries: &[Nomination]) -> Option<&Nomination> {
    entries
        .iter()
        .min_by(|a, b| (a.timestamp, &a.address).cmp(&(b.timestamp, &b.address)))
}

/// Shared nomination record for one node type.
pub struct NominationRecord {
    store: Arc<dyn FileSystem>,
    path: String,
    ttl: Duration,
}

impl NominationRecord {
    pub fn new(store: Arc<dyn FileSystem>, node_type: NodeType, ttl: Duration) -> Self {
        Self {
            store,
            path: cluster_file(node_type, NOMINATION_FILE),
            ttl,
        }
    }

    pub async fn entries(&self) -> LbResult<Vec<Nomination>> {
        let data = match self.store.read_file(&self.path).await {
            Ok(data) => data,
            Err(LbError::NotFound) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let text = String::from_utf8_lossy(&data);
        let entries = text
            .lines()
            .filter_map(|line| {
                let (address, timestamp) = line.trim().split_once(' ')?;
                Some(Nomination {
                    address: address.parse().ok()?,
                    timestamp: timestamp.parse().ok()?,
                })
            })
            .collect();
        Ok(entries)
    }

    /// Entries still inside the nomination TTL at `now` (unix ns).
    pub async fn live_entries(&self, now: u64) -> LbResult<Vec<Nomination>> {
        let ttl = self.ttl.as_nanos() as u64;
        let mut entries = self.entries().await?;
        entries.retain(|n| n.timestamp.saturating_add(ttl) >= now);
        Ok(entries)
    }

    /// Add `address` unless it already has a live entry; returns the live
    /// entries as read back from the store.
    pub async fn nominate(&self, address: &NodeAddress, now: u64) -> LbResult<Vec<Nomination>> {
        let live = self.live_entries(now).await?;
        if !live.iter().any(|n| &n.address == address) {
            let line = format!("{} {}\n", address, now);
            self.store.append_file(&self.path, line.as_bytes()).await?;
            debug!("election: nominated {} at {}", address, now);
        }
        self.live_entries(now).await
    }

    pub async fn clear(&self) -> LbResult<()> {
        match self.store.remove(&self.path).await {
            Ok(()) | Err(LbError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Everything one election attempt needs from its node.
pub struct ElectionContext<'a> {
    pub address: &'a NodeAddress,
    pub lease: &'a Lease,
    pub record: &'a NominationRecord,
    /// All members of the node type, including this node.
    pub members: &'a [NodeAddress],
    pub pool: &'a Arc<ConnectionPool>,
    pub timeout: Duration,
}

#[async_trait]
pub trait ElectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one attempt; `Ok(true)` means this node won and may claim the lease.
    async fn run(&self, ctx: &ElectionContext<'_>) -> LbResult<bool>;
}

pub fn strategy_for(kind: ElectionKind) -> Box<dyn ElectionStrategy> {
    match kind {
        ElectionKind::Nomination => Box::new(NominationElection),
        ElectionKind::Confirmation => Box::new(ConfirmationElection),
    }
}

/// Nominate this node and return its entry if it is the earliest one.
async fn nominate_and_check(ctx: &ElectionContext<'_>) -> LbResult<Option<Nomination>> {
    if let Some((primary, _)) = ctx.lease.current_primary(now_millis()).await? {
        if &primary != ctx.address {
            debug!("election: {} already holds the lease", primary);
            return Ok(None);
        }
    }

    let entries = ctx.record.nominate(ctx.address, now_nanos()).await?;
    match earliest(&entries) {
        Some(winner) if &winner.address == ctx.address => Ok(Some(winner.clone())),
        Some(winner) => {
            debug!("election: {} nominated earlier", winner.address);
            Ok(None)
        }
        None => {
            warn!("election: own nomination missing from record");
            Err(LbError::Eio)
        }
    }
}

pub struct NominationElection;

#[async_trait]
impl ElectionStrategy for NominationElection {
    fn name(&self) -> &'static str {
        "nomination"
    }

    async fn run(&self, ctx: &ElectionContext<'_>) -> LbResult<bool> {
        Ok(nominate_and_check(ctx).await?.is_some())
    }
}

/// First `ELECTION_MAX_VOTERS` members by address, trimmed to an odd count.
pub fn voting_subset(members: &[NodeAddress]) -> Vec<NodeAddress> {
    let mut voters = members.to_vec();
    voters.sort();
    voters.dedup();
    voters.truncate(ELECTION_MAX_VOTERS);
    if voters.len() % 2 == 0 {
        voters.pop();
    }
    voters
}

pub struct ConfirmationElection;

#[async_trait]
impl ElectionStrategy for ConfirmationElection {
    fn name(&self) -> &'static str {
        "confirmation"
    }

    async fn run(&self, ctx: &ElectionContext<'_>) -> LbResult<bool> {
        let Some(nomination) = nominate_and_check(ctx).await? else {
            return Ok(false);
        };

        let voters: Vec<NodeAddress> = voting_subset(ctx.members);
        let request = NodeMessage::ElectionRequest(ElectionRequest {
            address: ctx.address.clone(),
            seed: rand::random(),
            timestamp: nomination.timestamp,
        });

        // A member of the voter set counts its own vote.
        let mut respondents = 0usize;
        let mut granted = 0usize;
        let mut set = JoinSet::new();
        for voter in voters {
            if &voter == ctx.address {
                respondents += 1;
                granted += 1;
                continue;
            }
            let pool = ctx.pool.clone();
            let request = request.clone();
            set.spawn(async move {
                let reply = pool.send_on(&voter, ConnectionRoute::Election, &request).await;
                (voter, reply)
            });
        }

        let deadline = tokio::time::Instant::now() + ctx.timeout;
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok((voter, reply)))) => match reply {
                    Ok(NodeMessage::ElectionVote { granted: yes, .. }) => {
                        respondents += 1;
                        if yes {
                            granted += 1;
                        }
                    }
                    Ok(other) => warn!("election: unexpected reply {} from {}", other.kind(), voter),
                    Err(e) => debug!("election: no vote from {}: {}", voter, e),
                },
                Ok(Some(Err(e))) => warn!("election: vote task failed: {}", e),
                Ok(None) => break,
                Err(_) => {
                    debug!("election: vote window closed");
                    set.abort_all();
                    break;
                }
            }
        }

        // With no voter reachable the nomination record alone decides.
        let won = respondents == 0 || granted * 2 > respondents;
        info!(
            "election: {} received {}/{} votes ({})",
            ctx.address,
            granted,
            respondents,
            if won { "confirmed" } else { "rejected" }
        );
        Ok(won)
    }
}

/// Decide a confirmation vote for `request`.
///
/// Granted only when no other node holds a valid lease and the candidate is
/// the earliest live entry in the nomination record.
pub async fn grant_vote(
    lease: &Lease,
    record: &NominationRecord,
    request: &ElectionRequest,
) -> LbResult<bool> {
    if let Some((primary, _)) = lease.current_primary(now_millis()).await? {
        if primary != request.address {
            return Ok(false);
        }
    }
    let entries = record.live_entries(now_nanos()).await?;
    Ok(earliest(&entries).map(|n| n.address == request.address).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use litebase_core::connection::ConnectionConfig;
    use litebase_core::file_store::LocalFileSystem;
    use litebase_core::signature::NodeSigner;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn addr(port: u16) -> NodeAddress {
        NodeAddress::new("127.0.0.1", port)
    }

    fn record(store: Arc<dyn FileSystem>) -> NominationRecord {
        NominationRecord::new(store, NodeType::Query, Duration::from_secs(5))
    }

    fn lease(store: Arc<dyn FileSystem>, port: u16) -> Lease {
        Lease::new(
            store,
            addr(port),
            NodeType::Query,
            Duration::from_secs(70),
            Duration::from_secs(10),
        )
    }

    fn pool(port: u16) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(
            addr(port),
            Arc::new(NodeSigner::new("secret")),
            ConnectionConfig::default(),
            CancellationToken::new(),
        ))
    }

    #[test]
    fn test_earliest_breaks_ties_by_address() {
        let entries = vec![
            Nomination { address: addr(7002), timestamp: 10 },
            Nomination { address: addr(7001), timestamp: 10 },
            Nomination { address: addr(7000), timestamp: 11 },
        ];
        assert_eq!(earliest(&entries).unwrap().address, addr(7001));
        assert!(earliest(&[]).is_none());
    }

    #[test]
    fn test_voting_subset_is_odd() {
        let members: Vec<_> = (0..8).map(|i| addr(7000 + i)).collect();
        assert_eq!(voting_subset(&members), members[..5].to_vec());
        assert_eq!(voting_subset(&members[..4]), members[..3].to_vec());
        assert_eq!(voting_subset(&members[..1]), members[..1].to_vec());
        assert!(voting_subset(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_nominate_once_and_expire() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(dir.path()));
        let record = record(store);

        record.nominate(&addr(7000), 1_000).await.unwrap();
        let entries = record.nominate(&addr(7000), 1_001).await.unwrap();
        assert_eq!(entries.len(), 1);

        let entries = record.nominate(&addr(7001), 2_000).await.unwrap();
        assert_eq!(earliest(&entries).unwrap().address, addr(7000));

        // Past the TTL the first entry no longer counts.
        let later = 1_000 + Duration::from_secs(6).as_nanos() as u64;
        let entries = record.live_entries(later).await.unwrap();
        assert!(entries.is_empty());

        record.clear().await.unwrap();
        assert!(record.entries().await.unwrap().is_empty());
        record.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_nomination_election_earliest_wins() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(dir.path()));
        let record = record(store.clone());
        let lease_a = lease(store.clone(), 7000);
        let lease_b = lease(store, 7001);
        let members = vec![addr(7000), addr(7001)];
        let pool_a = pool(7000);
        let pool_b = pool(7001);

        let a_address = addr(7000);
        let ctx_a = ElectionContext {
            address: &a_address,
            lease: &lease_a,
            record: &record,
            members: &members,
            pool: &pool_a,
            timeout: Duration::from_secs(3),
        };
        let b_address = addr(7001);
        let ctx_b = ElectionContext {
            address: &b_address,
            lease: &lease_b,
            record: &record,
            members: &members,
            pool: &pool_b,
            timeout: Duration::from_secs(3),
        };

        assert!(NominationElection.run(&ctx_a).await.unwrap());
        assert!(!NominationElection.run(&ctx_b).await.unwrap());
        // Re-running does not change the verdict.
        assert!(NominationElection.run(&ctx_a).await.unwrap());
    }

    #[tokio::test]
    async fn test_valid_lease_blocks_election_and_votes() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(dir.path()));
        let record = record(store.clone());
        let holder = lease(store.clone(), 7000);
        holder.claim_primary(now_millis()).await.unwrap();
        holder.renew(now_millis()).await.unwrap();

        let lease_b = lease(store, 7001);
        let members = vec![addr(7000), addr(7001)];
        let pool_b = pool(7001);
        let b_address = addr(7001);
        let ctx = ElectionContext {
            address: &b_address,
            lease: &lease_b,
            record: &record,
            members: &members,
            pool: &pool_b,
            timeout: Duration::from_secs(3),
        };
        assert!(!NominationElection.run(&ctx).await.unwrap());
        assert!(record.entries().await.unwrap().is_empty());

        let request = ElectionRequest {
            address: addr(7001),
            seed: 1,
            timestamp: now_nanos(),
        };
        assert!(!grant_vote(&lease_b, &record, &request).await.unwrap());
    }

    #[tokio::test]
    async fn test_vote_follows_record() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(dir.path()));
        let record = record(store.clone());
        let voter = lease(store, 7002);

        let now = now_nanos();
        record.nominate(&addr(7000), now).await.unwrap();
        record.nominate(&addr(7001), now + 1).await.unwrap();

        let first = ElectionRequest { address: addr(7000), seed: 9, timestamp: now };
        let second = ElectionRequest { address: addr(7001), seed: 1, timestamp: now + 1 };
        assert!(grant_vote(&voter, &record, &first).await.unwrap());
        // The seed never reorders candidates.
        assert!(!grant_vote(&voter, &record, &second).await.unwrap());
    }

    #[tokio::test]
    async fn test_confirmation_without_reachable_voters() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(dir.path()));
        let record = record(store.clone());
        let lease_a = lease(store, 7000);
        let pool_a = pool(7000);
        let a_address = addr(7000);
        let members = vec![a_address.clone()];
        let ctx = ElectionContext {
            address: &a_address,
            lease: &lease_a,
            record: &record,
            members: &members,
            pool: &pool_a,
            timeout: Duration::from_millis(500),
        };
        assert!(ConfirmationElection.run(&ctx).await.unwrap());
    }
}
