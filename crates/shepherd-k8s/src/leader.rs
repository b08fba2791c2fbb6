//! Minimal leader election over a `coordination.k8s.io/v1` Lease, so a
//! multi-replica deployment runs exactly one controller and watcher (§1.1,
//! §6.6 `SHEPHERD_LEADER_ELECTION`).
//!
//! This is deliberately simpler than client-go's leaderelection package: one
//! lease, a fixed renew/retry cadence, and a `CancellationToken` that fires
//! the moment a renewal is lost rather than a full callback-based state
//! machine. Good enough for a single controller replica set; not a general
//! leader-election library.

use std::time::Duration;

use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Blocks until `identity` holds `lock_name`, then spawns a background task
/// that renews the lease every [`RENEW_INTERVAL`]. The returned token is
/// cancelled if a renewal is ever lost to another holder, so callers should
/// treat cancellation as "stop doing leader-only work immediately".
pub async fn acquire_and_hold(client: Client, namespace: &str, lock_name: &str, identity: &str) -> CancellationToken {
    let leases: Api<Lease> = Api::namespaced(client, namespace);
    let token = CancellationToken::new();

    loop {
        if try_acquire_or_renew(&leases, lock_name, identity).await {
            break;
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
    info!(identity, lock_name, "acquired leader lease");

    let renew_token = token.clone();
    let leases = leases.clone();
    let lock_name = lock_name.to_string();
    let identity = identity.to_string();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            if renew_token.is_cancelled() {
                return;
            }
            if !try_acquire_or_renew(&leases, &lock_name, &identity).await {
                warn!(identity = %identity, lock_name = %lock_name, "lost leader lease, stepping down");
                renew_token.cancel();
                return;
            }
        }
    });

    token
}

/// A no-op stand-in for `--leader-election=false`: callers get a token that
/// never cancels, so the same `tokio::select!` shutdown wiring works either
/// way.
pub fn always_leader() -> CancellationToken {
    CancellationToken::new()
}

async fn try_acquire_or_renew(leases: &Api<Lease>, lock_name: &str, identity: &str) -> bool {
    let now = MicroTime(chrono::Utc::now());
    match leases.get_opt(lock_name).await {
        Ok(None) => create_lease(leases, lock_name, identity, now).await,
        Ok(Some(existing)) => {
            let spec = existing.spec.unwrap_or_default();
            let held_by_other = spec.holder_identity.as_deref().is_some_and(|h| h != identity);
            if held_by_other && !lease_expired(&spec) {
                return false;
            }
            patch_lease(leases, lock_name, identity, now).await
        }
        Err(e) => {
            warn!(error = %e, "failed to read leader lease");
            false
        }
    }
}

fn lease_expired(spec: &LeaseSpec) -> bool {
    let Some(renew) = &spec.renew_time else { return true };
    let duration = spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECS);
    chrono::Utc::now() - renew.0 > chrono::Duration::seconds(duration as i64)
}

async fn create_lease(leases: &Api<Lease>, lock_name: &str, identity: &str, now: MicroTime) -> bool {
    let lease = Lease {
        metadata: kube::api::ObjectMeta {
            name: Some(lock_name.to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(identity.to_string()),
            lease_duration_seconds: Some(LEASE_DURATION_SECS),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            lease_transitions: Some(0),
            ..Default::default()
        }),
    };
    match leases.create(&Default::default(), &lease).await {
        Ok(_) => true,
        Err(e) => {
            warn!(error = %e, "failed to create leader lease");
            false
        }
    }
}

async fn patch_lease(leases: &Api<Lease>, lock_name: &str, identity: &str, now: MicroTime) -> bool {
    let patch = serde_json::json!({
        "spec": {
            "holderIdentity": identity,
            "leaseDurationSeconds": LEASE_DURATION_SECS,
            "renewTime": now,
        }
    });
    match leases
        .patch(lock_name, &PatchParams::apply("shepherd-leader-election"), &Patch::Apply(&patch))
        .await
    {
        Ok(_) => true,
        Err(e) => {
            warn!(error = %e, "failed to renew leader lease");
            false
        }
    }
}
