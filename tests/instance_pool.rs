// tests/instance_pool.rs

use std::error::Error;
use std::sync::Arc;

use serde_json::json;

use pkgcompile::cloud::CloudError;
use pkgcompile::errors::CompileError;
use pkgcompile::exec::{Instance, InstanceReuser, InstanceSpec, IpProvider};
use pkgcompile::types::Stemcell;
use pkgcompile_test_utils::builders::{ConfigFileBuilder, StemcellBuilder};
use pkgcompile_test_utils::harness::{DEPLOYMENT, Director};
use pkgcompile_test_utils::init_tracing;

type TestResult = Result<(), Box<dyn Error>>;

fn reuse_director() -> Director {
    Director::new(
        ConfigFileBuilder::new()
            .workers(3)
            .reuse_compilation_vms(true)
            .build(),
    )
}

fn bare_instance(director: &Director, stemcell: &Stemcell, id: &str) -> Arc<Instance> {
    let ips = director.ip_provider();
    let reservation = ips.reserve(id).expect("reserve");
    let spec = InstanceSpec {
        deployment: DEPLOYMENT.to_string(),
        cloud_properties: json!({}),
        env: json!({}),
        networks: ips.network_settings(&reservation),
        availability_zone: None,
    };
    Arc::new(Instance::new(id, stemcell.clone(), spec, reservation))
}

#[tokio::test]
async fn reused_vm_is_returned_to_idle_set() -> TestResult {
    init_tracing();
    let director = reuse_director();
    let ips = director.ip_provider();
    let pool = director.pool(ips.clone());
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();

    let first = pool
        .with_reused_vm(&stemcell, |instance| async move { Ok(instance.id().to_string()) })
        .await?;
    let second = pool
        .with_reused_vm(&stemcell, |instance| async move { Ok(instance.id().to_string()) })
        .await?;

    assert_eq!(first, second);
    assert_eq!(director.cloud.created_vms(), vec!["vm-1"]);
    assert_eq!(pool.reuser().num_instances(&stemcell), 1);
    assert_eq!(pool.reuser().num_in_use(&stemcell), 0);
    assert_eq!(ips.reserved_count(), 1);
    Ok(())
}

#[tokio::test]
async fn failing_callback_discards_reused_vm() -> TestResult {
    init_tracing();
    let director = reuse_director();
    let ips = director.ip_provider();
    let pool = director.pool(ips.clone());
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();

    let result: Result<(), CompileError> = pool
        .with_reused_vm(&stemcell, |_instance| async move {
            Err(CompileError::Agent {
                method: "compile_package".to_string(),
                message: "boom".to_string(),
            })
        })
        .await;

    assert!(matches!(result, Err(CompileError::Agent { .. })));
    assert_eq!(director.cloud.deleted_vms(), vec!["vm-1"]);
    assert_eq!(pool.reuser().num_instances(&stemcell), 0);
    assert_eq!(ips.reserved_count(), 0);
    assert!(director.vms.is_empty());

    // The next caller gets a fresh VM.
    pool.with_reused_vm(&stemcell, |_instance| async move { Ok(()) })
        .await?;
    assert_eq!(director.cloud.created_vms(), vec!["vm-1", "vm-2"]);
    Ok(())
}

#[tokio::test]
async fn busy_instances_are_not_shared() -> TestResult {
    init_tracing();
    let director = reuse_director();
    let pool = director.pool(director.ip_provider());
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();

    let (outer, inner) = pool
        .with_reused_vm(&stemcell, |outer| {
            let pool = &pool;
            let stemcell = &stemcell;
            async move {
                let inner = pool
                    .with_reused_vm(stemcell, |inner| async move { Ok(inner.id().to_string()) })
                    .await?;
                Ok::<_, CompileError>((outer.id().to_string(), inner))
            }
        })
        .await?;

    assert_ne!(outer, inner);
    assert_eq!(pool.reuser().num_instances(&stemcell), 2);

    pool.delete_instances(1).await?;
    assert_eq!(director.cloud.deleted_vms().len(), 2);
    assert!(director.cloud.live_vms().is_empty());
    assert!(pool.reuser().instances().is_empty());
    Ok(())
}

#[tokio::test]
async fn single_use_vm_is_always_deleted() -> TestResult {
    init_tracing();
    let director = Director::new(ConfigFileBuilder::new().build());
    let ips = director.ip_provider();
    let pool = director.pool(ips.clone());
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();

    let cid = pool
        .with_single_use_vm(&stemcell, |instance| async move {
            Ok(instance.vm_cid().unwrap_or_default())
        })
        .await?;
    assert_eq!(cid, "vm-1");

    let failed: Result<(), CompileError> = pool
        .with_single_use_vm(&stemcell, |_instance| async move {
            Err(CompileError::Cloud("nope".to_string()))
        })
        .await;
    assert!(failed.is_err());

    assert_eq!(director.cloud.deleted_vms(), vec!["vm-1", "vm-2"]);
    assert!(pool.reuser().instances().is_empty());
    assert_eq!(ips.reserved_count(), 0);
    Ok(())
}

#[tokio::test]
async fn with_vm_follows_reuse_policy() -> TestResult {
    init_tracing();
    let director = Director::new(ConfigFileBuilder::new().build());
    let pool = director.pool(director.ip_provider());
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();

    pool.with_vm(&stemcell, |_i| async move { Ok(()) }).await?;
    pool.with_vm(&stemcell, |_i| async move { Ok(()) }).await?;

    assert_eq!(director.cloud.created_vms().len(), 2);
    assert_eq!(director.cloud.deleted_vms().len(), 2);
    Ok(())
}

#[tokio::test]
async fn provisioning_failure_leaves_nothing_behind() -> TestResult {
    init_tracing();
    let director = reuse_director();
    let ips = director.ip_provider();
    let pool = director.pool(ips.clone());
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();
    director.cloud.fail_next_create(CloudError::VmCreationFailed {
        retryable: false,
        message: "quota".to_string(),
    });

    let mut called = false;
    let result = pool
        .with_reused_vm(&stemcell, |_i| {
            called = true;
            async move { Ok(()) }
        })
        .await;

    assert!(matches!(
        result,
        Err(CompileError::VmCreationFailed { retryable: false, .. })
    ));
    assert!(!called);
    assert!(director.cloud.deleted_vms().is_empty());
    assert_eq!(pool.reuser().num_instances(&stemcell), 0);
    assert_eq!(ips.reserved_count(), 0);
    Ok(())
}

#[test]
fn reuser_hands_out_idle_instances_only() {
    let director = reuse_director();
    let ubuntu = StemcellBuilder::new("ubuntu", "1").build();
    let centos = StemcellBuilder::new("centos", "7").build();
    let reuser = InstanceReuser::new();

    assert!(reuser.get_instance(&ubuntu).is_none());

    let instance = bare_instance(&director, &ubuntu, "i-1");
    reuser.add_in_use_instance(Arc::clone(&instance));
    assert!(reuser.get_instance(&ubuntu).is_none());
    assert_eq!(reuser.num_instances(&ubuntu), 1);

    reuser.release_instance(&instance);
    assert!(reuser.get_instance(&centos).is_none());
    let claimed = reuser.get_instance(&ubuntu).expect("idle instance");
    assert_eq!(claimed.id(), "i-1");
    assert_eq!(reuser.num_in_use(&ubuntu), 1);

    assert!(reuser.remove_instance(&instance));
    assert!(!reuser.remove_instance(&instance));
    assert_eq!(reuser.num_instances(&ubuntu), 0);
    assert!(reuser.instances().is_empty());
}

#[test]
fn reuser_claims_are_exclusive_across_threads() {
    let director = reuse_director();
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();
    let reuser = InstanceReuser::new();
    let instance = bare_instance(&director, &stemcell, "i-1");
    reuser.add_in_use_instance(Arc::clone(&instance));
    reuser.release_instance(&instance);

    let claims: usize = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| reuser.get_instance(&stemcell).is_some()))
            .collect();
        handles
            .into_iter()
            .map(|h| usize::from(h.join().expect("thread")))
            .sum()
    });

    assert_eq!(claims, 1);
}
