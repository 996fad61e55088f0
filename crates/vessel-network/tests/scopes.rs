//! Integration tests for scope creation, lookup, deletion and reload.

mod common;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio_util::sync::CancellationToken;
use vessel_common::{ErrorKind, VesselError, VesselResult};
use vessel_network::context::scope_key;
use vessel_network::{
    Context, FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, NullLink, Range, ScopeData,
    ScopeType, TrustLevel,
};

use common::{config, config_with_public, fixture, fixture_with, token};

fn net(s: &str) -> Ipv4Net {
    s.parse().unwrap()
}

fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

#[test_log::test(tokio::test)]
async fn default_bridge_allocation() {
    let f = fixture().await;

    let default = f.ctx.default_scope();
    assert_eq!(default.name(), "bridge");
    assert!(default.builtin());
    assert_eq!(default.subnet(), Some(net("172.16.0.0/16")));
    assert_eq!(default.gateway(), ip("172.16.0.1"));

    let bar1 = f.ctx.new_scope(&token(), ScopeData::bridge("bar1")).await.unwrap();
    assert_eq!(bar1.scope_type(), ScopeType::Bridge);
    assert_eq!(bar1.subnet(), Some(net("172.17.0.0/16")));
    assert_eq!(bar1.gateway(), ip("172.17.0.1"));
    assert!(!bar1.builtin());

    let ten = f
        .ctx
        .new_scope(&token(), ScopeData::bridge("ten").with_subnet(net("10.10.0.0/16")))
        .await
        .unwrap();
    assert_eq!(ten.subnet(), Some(net("10.10.0.0/16")));
    assert_eq!(ten.gateway(), ip("10.10.0.1"));

    // a subnet outside the pool leaves the pool untouched
    let bar2 = f.ctx.new_scope(&token(), ScopeData::bridge("bar2")).await.unwrap();
    assert_eq!(bar2.subnet(), Some(net("172.18.0.0/16")));

    let addrs = f.link.addrs();
    for gw in ["172.16.0.1/16", "172.17.0.1/16", "10.10.0.1/16", "172.18.0.1/16"] {
        assert!(addrs.contains(&net(gw)), "{} missing from link", gw);
    }
}

#[test_log::test(tokio::test)]
async fn overlapping_subnet_is_rejected() {
    let f = fixture().await;
    f.ctx
        .new_scope(&token(), ScopeData::bridge("ten").with_subnet(net("10.10.0.0/16")))
        .await
        .unwrap();

    let err = f
        .ctx
        .new_scope(&token(), ScopeData::bridge("x").with_subnet(net("10.10.128.0/17")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OverlappingAllocation);

    let err = f.ctx.scopes(Some("x")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test_log::test(tokio::test)]
async fn bad_scope_requests() {
    let f = fixture().await;
    f.ctx.new_scope(&token(), ScopeData::bridge("bar1")).await.unwrap();

    let err = f.ctx.new_scope(&token(), ScopeData::bridge("bar1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Duplicate);

    let err = f.ctx.new_scope(&token(), ScopeData::bridge("")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);

    let err = f
        .ctx
        .new_scope(
            &token(),
            ScopeData::bridge("gw").with_subnet(net("10.30.0.0/24")).with_gateway(ip("10.30.0.255")),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfRange);

    // pools need a gateway and subnet on external scopes
    let err = f
        .ctx
        .new_scope(&token(), ScopeData::external("ext").with_pool("10.40.0.0/24"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);

    let err = f
        .ctx
        .new_scope(
            &token(),
            ScopeData::external("ext")
                .with_subnet(net("172.20.0.0/16"))
                .with_gateway(ip("172.20.0.1")),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OverlappingAllocation);

    let err = f
        .ctx
        .new_scope(&token(), ScopeData::external("no-port-group"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);

    // failed creations leave the bridge pool untouched
    let next = f.ctx.new_scope(&token(), ScopeData::bridge("bar2")).await.unwrap();
    assert_eq!(next.subnet(), Some(net("172.18.0.0/16")));
}

#[test_log::test(tokio::test)]
async fn external_scope_with_pools() {
    let f = fixture().await;
    let ext = f
        .ctx
        .new_scope(
            &token(),
            ScopeData::external("ext")
                .with_subnet(net("10.50.0.0/16"))
                .with_gateway(ip("10.50.0.1"))
                .with_dns(ip("10.50.0.53"))
                .with_pool("10.50.1.0/24")
                .with_pool("10.50.2.10-20")
                .with_trust_level(TrustLevel::Open),
        )
        .await
        .unwrap();

    assert_eq!(ext.scope_type(), ScopeType::External);
    assert!(!ext.is_dynamic());
    assert_eq!(ext.gateway(), ip("10.50.0.1"));
    assert_eq!(ext.dns(), vec![ip("10.50.0.53")]);
    assert_eq!(ext.trust_level(), TrustLevel::Open);
    assert_eq!(
        ext.pools(),
        vec![
            Range::parse("10.50.1.0/24").unwrap(),
            Range::parse("10.50.2.10-10.50.2.20").unwrap()
        ]
    );

    // external gateways never go on the bridge link
    assert!(!f.link.addrs().contains(&net("10.50.0.1/16")));

    let dynamic = f.ctx.new_scope(&token(), ScopeData::external("ext2")).await.unwrap();
    assert!(dynamic.is_dynamic());
    assert_eq!(dynamic.subnet(), None);
}

#[test_log::test(tokio::test)]
async fn builtin_scopes_from_config() {
    let f = fixture_with(config_with_public()).await;

    let public = f.ctx.scopes(Some("public")).await.unwrap();
    assert_eq!(public.len(), 1);
    let public = &public[0];
    assert!(public.builtin());
    assert_eq!(public.scope_type(), ScopeType::External);
    assert_eq!(public.subnet(), Some(net("192.168.100.0/24")));
    assert_eq!(public.gateway(), ip("192.168.100.1"));
    assert_eq!(public.dns(), vec![ip("192.168.100.53")]);

    // builtin scopes are never persisted
    let err = f.kv.list(r"context\.scopes\..+").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);
}

#[test_log::test(tokio::test)]
async fn scope_lookup() {
    let f = fixture().await;
    let bar1 = f.ctx.new_scope(&token(), ScopeData::bridge("bar1")).await.unwrap();

    let names: Vec<String> = f
        .ctx
        .scopes(None)
        .await
        .unwrap()
        .iter()
        .map(|s| s.name().to_string())
        .collect();
    assert_eq!(names, vec!["bar1", "bridge"]);
    assert_eq!(f.ctx.scopes(Some("")).await.unwrap().len(), 2);

    let default = f.ctx.scopes(Some("default")).await.unwrap();
    assert!(Arc::ptr_eq(&default[0], f.ctx.default_scope()));

    let by_name = f.ctx.scopes(Some("bar1")).await.unwrap();
    assert!(Arc::ptr_eq(&by_name[0], &bar1));

    let prefix = bar1.id().to_string()[..13].to_string();
    let by_id = f.ctx.scopes(Some(prefix.as_str())).await.unwrap();
    assert_eq!(by_id.len(), 1);
    assert!(Arc::ptr_eq(&by_id[0], &bar1));

    let err = f.ctx.scopes(Some("nope")).await.unwrap_err();
    assert!(err.is_not_found());
}

#[test_log::test(tokio::test)]
async fn delete_scope_frees_everything() {
    let f = fixture().await;
    f.ctx.new_scope(&token(), ScopeData::bridge("bar1")).await.unwrap();
    f.kv.get(&scope_key("bar1")).await.unwrap();

    f.ctx.delete_scope(&token(), "bar1").await.unwrap();

    let err = f.kv.get(&scope_key("bar1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);
    assert!(!f.link.addrs().contains(&net("172.17.0.1/16")));
    assert!(f.ctx.scopes(Some("bar1")).await.is_err());

    let again = f.ctx.new_scope(&token(), ScopeData::bridge("bar1")).await.unwrap();
    assert_eq!(again.subnet(), Some(net("172.17.0.0/16")));
}

#[test_log::test(tokio::test)]
async fn delete_scope_rules() {
    let f = fixture().await;

    for name in ["default", "bridge"] {
        let err = f.ctx.delete_scope(&token(), name).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PolicyViolation);
    }

    let err = f.ctx.delete_scope(&token(), "missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // a record already gone from the store is not an error
    f.ctx.new_scope(&token(), ScopeData::bridge("bar1")).await.unwrap();
    f.kv.delete(&token(), &scope_key("bar1")).await.unwrap();
    f.ctx.delete_scope(&token(), "bar1").await.unwrap();
}

#[test_log::test(tokio::test)]
async fn exhaust_delete_and_reuse() {
    let f = fixture().await;

    // the builtin bridge holds one of the sixteen /16 networks
    let mut created = Vec::new();
    for i in 0..15 {
        let scope = f
            .ctx
            .new_scope(&token(), ScopeData::bridge(format!("b{}", i)))
            .await
            .unwrap();
        created.push(scope);
    }

    let err = f.ctx.new_scope(&token(), ScopeData::bridge("overflow")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExhaustedPool);

    let victim = &created[7];
    let freed = victim.subnet();
    f.ctx.delete_scope(&token(), victim.name()).await.unwrap();

    let reused = f.ctx.new_scope(&token(), ScopeData::bridge("reused")).await.unwrap();
    assert_eq!(reused.subnet(), freed);
}

#[test_log::test(tokio::test)]
async fn create_delete_churn() {
    let f = fixture().await;
    for _ in 0..100 {
        let scope = f.ctx.new_scope(&token(), ScopeData::bridge("churn")).await.unwrap();
        assert_eq!(scope.subnet(), Some(net("172.17.0.0/16")));
        f.ctx.delete_scope(&token(), "churn").await.unwrap();
    }
    assert_eq!(f.link.addrs(), vec![net("172.16.0.1/16")]);
}

#[test_log::test(tokio::test)]
async fn restart_restores_scopes() {
    let f = fixture().await;
    let bar1 = f.ctx.new_scope(&token(), ScopeData::bridge("bar1")).await.unwrap();
    let ext = f
        .ctx
        .new_scope(
            &token(),
            ScopeData::external("ext")
                .with_subnet(net("10.60.0.0/16"))
                .with_gateway(ip("10.60.0.1"))
                .with_dns(ip("10.60.0.53"))
                .with_pool("10.60.0.100-10.60.0.200")
                .with_annotation("owner", "ops")
                .internal(true),
        )
        .await
        .unwrap();

    let link = Arc::new(NullLink::new());
    let restarted = Context::builder(config())
        .with_kv(f.kv.clone())
        .with_bridge_link(link.clone())
        .build()
        .await
        .unwrap();

    for original in [&bar1, &ext] {
        let reloaded = restarted.scopes(Some(original.name())).await.unwrap();
        assert_eq!(reloaded[0].record(), original.record());
    }

    assert!(link.addrs().contains(&net("172.17.0.1/16")));

    // reloaded subnets are reserved again
    let next = restarted.new_scope(&token(), ScopeData::bridge("bar2")).await.unwrap();
    assert_eq!(next.subnet(), Some(net("172.18.0.0/16")));
}

#[test_log::test(tokio::test)]
async fn restart_skips_bad_records() {
    let kv = Arc::new(MemoryKeyValueStore::new("test"));
    kv.put(&token(), &scope_key("junk"), b"not json").await.unwrap();

    let ctx = Context::builder(config()).with_kv(kv.clone()).build().await.unwrap();
    assert_eq!(ctx.scopes(None).await.unwrap().len(), 1);
}

#[test_log::test(tokio::test)]
async fn file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kv").join("network.dat");

    {
        let kv = Arc::new(FileKeyValueStore::open(&path).await.unwrap());
        let ctx = Context::builder(config()).with_kv(kv).build().await.unwrap();
        ctx.new_scope(&token(), ScopeData::bridge("bar1")).await.unwrap();
    }

    let kv = Arc::new(FileKeyValueStore::open(&path).await.unwrap());
    let ctx = Context::builder(config()).with_kv(kv).build().await.unwrap();
    let bar1 = ctx.scopes(Some("bar1")).await.unwrap();
    assert_eq!(bar1[0].subnet(), Some(net("172.17.0.0/16")));
}

/// Memory store whose writes can be made to fail.
struct FlakyStore {
    inner: MemoryKeyValueStore,
    fail: AtomicBool,
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn put(&self, cancel: &CancellationToken, key: &str, value: &[u8]) -> VesselResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(VesselError::persistence(format!("put {} refused", key)));
        }
        self.inner.put(cancel, key, value).await
    }

    async fn get(&self, key: &str) -> VesselResult<Vec<u8>> {
        self.inner.get(key).await
    }

    async fn list(&self, pattern: &str) -> VesselResult<HashMap<String, Vec<u8>>> {
        self.inner.list(pattern).await
    }

    async fn delete(&self, cancel: &CancellationToken, key: &str) -> VesselResult<()> {
        self.inner.delete(cancel, key).await
    }

    async fn save(&self, cancel: &CancellationToken) -> VesselResult<()> {
        self.inner.save(cancel).await
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

#[test_log::test(tokio::test)]
async fn persistence_failure_rolls_back() {
    let kv = Arc::new(FlakyStore {
        inner: MemoryKeyValueStore::default(),
        fail: AtomicBool::new(true),
    });
    let link = Arc::new(NullLink::new());
    let ctx = Context::builder(config())
        .with_kv(kv.clone())
        .with_bridge_link(link.clone())
        .build()
        .await
        .unwrap();

    let err = ctx.new_scope(&token(), ScopeData::bridge("bar1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Persistence);
    assert!(ctx.scopes(Some("bar1")).await.unwrap_err().is_not_found());
    assert_eq!(link.addrs(), vec![net("172.16.0.1/16")]);

    kv.fail.store(false, Ordering::SeqCst);
    let bar1 = ctx.new_scope(&token(), ScopeData::bridge("bar1")).await.unwrap();
    assert_eq!(bar1.subnet(), Some(net("172.17.0.0/16")));
}

#[test_log::test(tokio::test)]
async fn cancelled_creation_rolls_back() {
    let f = fixture().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = f.ctx.new_scope(&cancel, ScopeData::bridge("bar1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(f.ctx.scopes(Some("bar1")).await.is_err());

    let bar1 = f.ctx.new_scope(&token(), ScopeData::bridge("bar1")).await.unwrap();
    assert_eq!(bar1.subnet(), Some(net("172.17.0.0/16")));
}
