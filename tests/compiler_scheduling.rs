// tests/compiler_scheduling.rs

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use pkgcompile::dag::keys::{cache_key, dependency_key};
use pkgcompile::engine::COMPILE_STAGE;
use pkgcompile::errors::CompileError;
use pkgcompile::release::ReleaseVersion;
use pkgcompile::store::CompiledPackageStore;
use pkgcompile::types::{CompiledArtifact, CompiledPackage, Stemcell};
use pkgcompile_test_utils::builders::{
    ConfigFileBuilder, JobBuilder, PackageBuilder, ReleaseBuilder, StemcellBuilder, as_jobs,
};
use pkgcompile_test_utils::fakes::{
    FakeAgentConnector, FakeDirectorTask, FakeGlobalCache, RecordingEventLog,
};
use pkgcompile_test_utils::harness::Director;
use pkgcompile_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

fn ruby_release() -> Arc<ReleaseVersion> {
    ReleaseBuilder::new("appcloud")
        .package(PackageBuilder::new("common"))
        .package(PackageBuilder::new("ruby").depends_on("common"))
        .package(PackageBuilder::new("needs_ruby").depends_on("ruby"))
        .build()
}

/// Store a compiled package for `name` exactly as a previous run would have.
async fn precompile(
    director: &Director,
    release: &ReleaseVersion,
    name: &str,
    stemcell: &Stemcell,
) -> TestResult {
    let package = release.package(name).ok_or("unknown package")?;
    let dep_key = dependency_key(&release.transitive_dependencies(package)?);
    director
        .compiled_packages
        .create(CompiledPackage {
            package_id: package.id,
            package_name: package.name.clone(),
            package_version: package.version.clone(),
            stemcell_id: stemcell.id,
            dependency_key: dep_key,
            build: 1,
            sha1: format!("old-sha1-{name}"),
            blobstore_id: format!("old-blob-{name}"),
        })
        .await?;
    Ok(())
}

#[tokio::test]
async fn compiles_dependency_chain_in_order() -> TestResult {
    init_tracing();
    let director = Director::new(ConfigFileBuilder::new().workers(3).build());
    let release = ruby_release();
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();
    let job = JobBuilder::new("web", &release, &stemcell)
        .template("app", &["needs_ruby"])
        .build();

    let mut run = director.compilation(as_jobs(&[job.clone()]));
    with_timeout(run.compiler.perform()).await?;

    assert_eq!(director.agents.compiled_names(), vec!["common", "ruby", "needs_ruby"]);
    assert_eq!(run.compiler.compile_tasks_count(), 3);
    assert_eq!(run.compiler.compilations_performed(), 3);

    let common = director.agents.compile_request("common").ok_or("common not compiled")?;
    assert_eq!(common.version, "1.0.1");
    assert_eq!(common.blobstore_id, "blob-common");
    assert_eq!(common.sha1, "sha1-common");
    assert!(common.dependencies.is_empty());

    let needs_ruby = director
        .agents
        .compile_request("needs_ruby")
        .ok_or("needs_ruby not compiled")?;
    assert_eq!(needs_ruby.dependencies.keys().collect::<Vec<_>>(), vec!["ruby"]);
    let ruby_dep = &needs_ruby.dependencies["ruby"];
    assert_eq!(ruby_dep.name, "ruby");
    assert_eq!(ruby_dep.version, "1.0.1");
    assert_eq!(ruby_dep.sha1, "compiled-sha1-ruby-1.0.1");
    assert_eq!(ruby_dep.blobstore_id, "compiled-blob-ruby-1.0.1");

    let compiled = job.compiled_packages();
    assert_eq!(compiled.keys().collect::<Vec<_>>(), vec!["common", "needs_ruby", "ruby"]);
    assert_eq!(director.compiled_packages.all().len(), 3);
    Ok(())
}

#[tokio::test]
async fn already_compiled_packages_need_no_vms() -> TestResult {
    init_tracing();
    let director = Director::new(ConfigFileBuilder::new().build());
    let mut builder = ReleaseBuilder::new("big");
    let names: Vec<String> = (0..11).map(|i| format!("pkg{i}")).collect();
    for (i, name) in names.iter().enumerate() {
        let mut pkg = PackageBuilder::new(name);
        if i > 0 {
            pkg = pkg.depends_on(&names[i - 1]);
        }
        builder = builder.package(pkg);
    }
    let release = builder.build();
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();
    for name in &names {
        precompile(&director, &release, name, &stemcell).await?;
    }

    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let job = JobBuilder::new("web", &release, &stemcell)
        .template("app", &refs[..6])
        .template("extra", &refs[6..])
        .build();

    let mut run = director.compilation(as_jobs(&[job.clone()]));
    with_timeout(run.compiler.perform()).await?;

    assert_eq!(run.compiler.compile_tasks_count(), 11);
    assert_eq!(run.compiler.compilations_performed(), 0);
    assert!(director.cloud.create_calls().is_empty());
    assert!(director.agents.compile_calls().is_empty());
    // Jobs still learn about every package they need.
    assert_eq!(job.compiled_packages().len(), 11);
    Ok(())
}

#[tokio::test]
async fn single_use_vms_are_created_and_deleted_per_task() -> TestResult {
    init_tracing();
    let director = Director::new(ConfigFileBuilder::new().workers(2).build());
    let release = ruby_release();
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();
    let job = JobBuilder::new("web", &release, &stemcell)
        .template("app", &["needs_ruby"])
        .build();

    let mut run = director.compilation(as_jobs(&[job]));
    with_timeout(run.compiler.perform()).await?;

    assert_eq!(director.cloud.created_vms().len(), 3);
    let mut created = director.cloud.created_vms();
    let mut deleted = director.cloud.deleted_vms();
    created.sort();
    deleted.sort();
    assert_eq!(created, deleted);
    assert!(director.cloud.live_vms().is_empty());
    assert!(director.vms.is_empty());
    assert_eq!(run.ip_provider.reserved_count(), 0);
    Ok(())
}

#[tokio::test]
async fn reused_vms_never_exceed_worker_count() -> TestResult {
    init_tracing();
    let agents = FakeAgentConnector::new().with_compile_delay(Duration::from_millis(30));
    let director = Director::with_agents(
        ConfigFileBuilder::new()
            .workers(2)
            .reuse_compilation_vms(true)
            .build(),
        agents,
    );
    let mut builder = ReleaseBuilder::new("flat");
    for name in ["a", "b", "c", "d", "e", "f"] {
        builder = builder.package(PackageBuilder::new(name));
    }
    let release = builder.build();
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();
    let job = JobBuilder::new("web", &release, &stemcell)
        .template("app", &["a", "b", "c", "d", "e", "f"])
        .build();

    let mut run = director.compilation(as_jobs(&[job]));
    with_timeout(run.compiler.perform()).await?;

    assert_eq!(run.compiler.compilations_performed(), 6);
    assert!(director.agents.max_concurrent_compiles() <= 2);
    assert!(director.cloud.created_vms().len() <= 2);
    assert!(director.cloud.max_live_vms() <= 2);
    // The pool is drained at the end of the run.
    assert!(director.cloud.live_vms().is_empty());
    assert!(run.pool.reuser().instances().is_empty());
    Ok(())
}

#[tokio::test]
async fn compile_failure_aborts_and_discards_instance() -> TestResult {
    init_tracing();
    let director = Director::new(
        ConfigFileBuilder::new()
            .workers(1)
            .reuse_compilation_vms(true)
            .build(),
    );
    director.agents.fail_package("ruby");
    let release = ruby_release();
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();
    let job = JobBuilder::new("web", &release, &stemcell)
        .template("app", &["needs_ruby"])
        .build();

    let mut run = director.compilation(as_jobs(&[job.clone()]));
    let err = with_timeout(run.compiler.perform())
        .await
        .expect_err("ruby should fail");

    assert!(matches!(err, CompileError::Agent { .. }), "got {err}");
    assert_eq!(director.agents.compiled_names(), vec!["common", "ruby"]);

    // common compiled on vm-1, which was reused for ruby and thrown away.
    assert_eq!(director.cloud.created_vms(), vec!["vm-1"]);
    assert_eq!(director.cloud.deleted_vms(), vec!["vm-1"]);
    assert!(run.pool.reuser().instances().is_empty());

    let stored: Vec<String> = director
        .compiled_packages
        .all()
        .into_iter()
        .map(|cp| cp.package_name)
        .collect();
    assert_eq!(stored, vec!["common"]);
    assert!(!job.compiled_packages().contains_key("needs_ruby"));
    Ok(())
}

#[tokio::test]
async fn unreachable_agent_deletes_vm_exactly_once() -> TestResult {
    init_tracing();
    for reuse in [false, true] {
        let director = Director::new(
            ConfigFileBuilder::new()
                .reuse_compilation_vms(reuse)
                .build(),
        );
        director.agents.unreachable();
        let release = ReleaseBuilder::new("r")
            .package(PackageBuilder::new("common"))
            .build();
        let stemcell = StemcellBuilder::new("ubuntu", "1").build();
        let job = JobBuilder::new("web", &release, &stemcell)
            .template("app", &["common"])
            .build();

        let mut run = director.compilation(as_jobs(&[job]));
        let err = with_timeout(run.compiler.perform())
            .await
            .expect_err("agent never comes up");

        assert!(matches!(err, CompileError::RpcTimeout { .. }), "got {err}");
        assert_eq!(director.cloud.deleted_vms(), vec!["vm-1"], "reuse = {reuse}");
        assert!(director.vms.is_empty());
        assert!(director.agents.compile_calls().is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn global_cache_hit_skips_compilation() -> TestResult {
    init_tracing();
    let director = Director::new(ConfigFileBuilder::new().use_compiled_package_cache(true).build());
    let release = ReleaseBuilder::new("r")
        .package(PackageBuilder::new("common"))
        .build();
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();
    let common = release.package("common").ok_or("missing")?;

    let cache = Arc::new(FakeGlobalCache::new());
    cache.insert(
        &cache_key(common, &dependency_key(&[]), &stemcell),
        CompiledArtifact {
            sha1: "cached-sha1".to_string(),
            blobstore_id: "cached-blob".to_string(),
        },
    );

    let job = JobBuilder::new("web", &release, &stemcell)
        .template("app", &["common"])
        .build();
    let mut run = director.compilation(as_jobs(&[job.clone()]));
    run.compiler = run.compiler.with_global_cache(cache.clone());
    with_timeout(run.compiler.perform()).await?;

    assert_eq!(run.compiler.compilations_performed(), 0);
    assert!(director.cloud.create_calls().is_empty());
    assert!(cache.saves().is_empty());

    let stored = director.compiled_packages.all();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].sha1, "cached-sha1");
    assert_eq!(stored[0].blobstore_id, "cached-blob");
    assert_eq!(stored[0].build, 1);
    assert_eq!(job.compiled_packages()["common"].sha1, "cached-sha1");
    Ok(())
}

#[tokio::test]
async fn global_cache_miss_saves_once() -> TestResult {
    init_tracing();
    let director = Director::new(ConfigFileBuilder::new().use_compiled_package_cache(true).build());
    let release = ReleaseBuilder::new("r")
        .package(PackageBuilder::new("common"))
        .build();
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();
    let common = release.package("common").ok_or("missing")?;
    let expected_key = cache_key(common, &dependency_key(&[]), &stemcell);

    let cache = Arc::new(FakeGlobalCache::new());
    let job = JobBuilder::new("web", &release, &stemcell)
        .template("app", &["common"])
        .build();
    let mut run = director.compilation(as_jobs(&[job]));
    run.compiler = run.compiler.with_global_cache(cache.clone());
    with_timeout(run.compiler.perform()).await?;

    assert_eq!(run.compiler.compilations_performed(), 1);
    let saves = cache.saves();
    assert_eq!(saves.len(), 1);
    assert_eq!(saves[0].0, expected_key);
    assert_eq!(saves[0].1.package_name, "common");
    Ok(())
}

#[tokio::test]
async fn broken_global_cache_is_treated_as_miss() -> TestResult {
    init_tracing();
    let director = Director::new(ConfigFileBuilder::new().use_compiled_package_cache(true).build());
    let release = ruby_release();
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();
    let cache = Arc::new(FakeGlobalCache::new());
    cache.break_cache();

    let job = JobBuilder::new("web", &release, &stemcell)
        .template("app", &["ruby"])
        .build();
    let mut run = director.compilation(as_jobs(&[job]));
    run.compiler = run.compiler.with_global_cache(cache);
    with_timeout(run.compiler.perform()).await?;

    assert_eq!(run.compiler.compilations_performed(), 2);
    Ok(())
}

#[tokio::test]
async fn global_cache_is_ignored_when_disabled() -> TestResult {
    init_tracing();
    let director = Director::new(ConfigFileBuilder::new().build());
    let release = ReleaseBuilder::new("r")
        .package(PackageBuilder::new("common"))
        .build();
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();
    let common = release.package("common").ok_or("missing")?;
    let cache = Arc::new(FakeGlobalCache::new());
    cache.insert(
        &cache_key(common, &dependency_key(&[]), &stemcell),
        CompiledArtifact {
            sha1: "cached-sha1".to_string(),
            blobstore_id: "cached-blob".to_string(),
        },
    );

    let job = JobBuilder::new("web", &release, &stemcell)
        .template("app", &["common"])
        .build();
    let mut run = director.compilation(as_jobs(&[job]));
    run.compiler = run.compiler.with_global_cache(cache.clone());
    with_timeout(run.compiler.perform()).await?;

    assert_eq!(run.compiler.compilations_performed(), 1);
    assert!(cache.saves().is_empty());
    Ok(())
}

#[tokio::test]
async fn cancellation_stops_before_next_wave() -> TestResult {
    init_tracing();
    let director = Director::new(ConfigFileBuilder::new().build());
    let release = ruby_release();
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();
    let job = JobBuilder::new("web", &release, &stemcell)
        .template("app", &["needs_ruby"])
        .build();

    let task = Arc::new(FakeDirectorTask::cancel_after(1));
    let mut run = director.compilation(as_jobs(&[job.clone()]));
    run.compiler = run.compiler.with_director_task(task.clone());
    with_timeout(run.compiler.perform()).await?;

    assert_eq!(director.agents.compiled_names(), vec!["common"]);
    assert_eq!(task.checkpoints(), 1);
    // What was compiled before cancelling is kept.
    assert_eq!(director.compiled_packages.all().len(), 1);
    assert!(job.compiled_packages().contains_key("common"));
    assert!(director.cloud.live_vms().is_empty());
    Ok(())
}

#[tokio::test]
async fn cancelled_run_dispatches_nothing() -> TestResult {
    init_tracing();
    let director = Director::new(ConfigFileBuilder::new().build());
    let release = ruby_release();
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();
    let job = JobBuilder::new("web", &release, &stemcell)
        .template("app", &["needs_ruby"])
        .build();

    let mut run = director.compilation(as_jobs(&[job]));
    run.compiler = run
        .compiler
        .with_director_task(Arc::new(FakeDirectorTask::cancel_after(0)));
    with_timeout(run.compiler.perform()).await?;

    assert!(director.cloud.create_calls().is_empty());
    assert_eq!(run.compiler.compilations_performed(), 0);
    Ok(())
}

#[tokio::test]
async fn checkpoints_at_every_dispatching_wave() -> TestResult {
    init_tracing();
    let director = Director::new(ConfigFileBuilder::new().workers(4).build());
    let release = ruby_release();
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();
    let job = JobBuilder::new("web", &release, &stemcell)
        .template("app", &["needs_ruby"])
        .build();

    let task = Arc::new(FakeDirectorTask::never_cancelled());
    let mut run = director.compilation(as_jobs(&[job]));
    run.compiler = run.compiler.with_director_task(task.clone());
    with_timeout(run.compiler.perform()).await?;

    // A strict chain needs one wave per package.
    assert_eq!(task.checkpoints(), 3);
    Ok(())
}

#[tokio::test]
async fn build_numbers_continue_from_existing_builds() -> TestResult {
    init_tracing();
    let director = Director::new(ConfigFileBuilder::new().build());
    let release = ReleaseBuilder::new("r")
        .package(PackageBuilder::new("common"))
        .build();
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();
    let common = release.package("common").ok_or("missing")?;

    // Same package and stemcell, built against other dependencies.
    for build in [1, 3] {
        director
            .compiled_packages
            .create(CompiledPackage {
                package_id: common.id,
                package_name: "common".to_string(),
                package_version: "1.0".to_string(),
                stemcell_id: stemcell.id,
                dependency_key: format!("other-deps-{build}"),
                build,
                sha1: "x".to_string(),
                blobstore_id: "y".to_string(),
            })
            .await?;
    }

    let job = JobBuilder::new("web", &release, &stemcell)
        .template("app", &["common"])
        .build();
    let mut run = director.compilation(as_jobs(&[job.clone()]));
    with_timeout(run.compiler.perform()).await?;

    let request = director.agents.compile_request("common").ok_or("not compiled")?;
    assert_eq!(request.version, "1.0.4");
    assert_eq!(job.compiled_packages()["common"].build, 4);
    Ok(())
}

#[tokio::test]
async fn shared_packages_compile_once_for_all_jobs() -> TestResult {
    init_tracing();
    let director = Director::new(ConfigFileBuilder::new().workers(3).build());
    let release = ruby_release();
    let ubuntu = StemcellBuilder::new("ubuntu", "1").build();
    let centos = StemcellBuilder::new("centos", "7").build();
    let web = JobBuilder::new("web", &release, &ubuntu)
        .template("app", &["needs_ruby"])
        .build();
    let worker = JobBuilder::new("worker", &release, &ubuntu)
        .template("bg", &["ruby"])
        .build();
    let batch = JobBuilder::new("batch", &release, &centos)
        .template("bg", &["common"])
        .build();

    let mut run = director.compilation(as_jobs(&[web.clone(), worker.clone(), batch.clone()]));
    with_timeout(run.compiler.perform()).await?;

    assert_eq!(run.compiler.compile_tasks_count(), 4);
    assert_eq!(run.compiler.compilations_performed(), 4);
    assert_eq!(web.compiled_packages().len(), 3);
    assert_eq!(worker.compiled_packages().len(), 2);
    assert_eq!(batch.compiled_packages().len(), 1);
    assert_eq!(
        web.compiled_packages()["common"],
        worker.compiled_packages()["common"]
    );
    assert_ne!(
        web.compiled_packages()["common"].stemcell_id,
        batch.compiled_packages()["common"].stemcell_id
    );
    Ok(())
}

#[tokio::test]
async fn compilation_vms_are_tagged_while_compiling() -> TestResult {
    init_tracing();
    let director = Director::new(ConfigFileBuilder::new().build());
    let release = ReleaseBuilder::new("r")
        .package(PackageBuilder::new("common"))
        .build();
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();
    let job = JobBuilder::new("web", &release, &stemcell)
        .template("app", &["common"])
        .build();

    let mut run = director.compilation(as_jobs(&[job]));
    with_timeout(run.compiler.perform()).await?;

    let metadata = director.cloud.metadata_for("vm-1");
    assert_eq!(metadata.len(), 2);
    assert_eq!(metadata[0]["director"], "test-director");
    assert_eq!(metadata[0]["deployment"], "test-deployment");
    assert_eq!(metadata[1]["compiling"], "common");
    Ok(())
}

#[tokio::test]
async fn metadata_failures_do_not_fail_compilation() -> TestResult {
    init_tracing();
    let director = Director::new(ConfigFileBuilder::new().build());
    director.cloud.fail_metadata();
    let release = ruby_release();
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();
    let job = JobBuilder::new("web", &release, &stemcell)
        .template("app", &["ruby"])
        .build();

    let mut run = director.compilation(as_jobs(&[job]));
    with_timeout(run.compiler.perform()).await?;

    assert_eq!(run.compiler.compilations_performed(), 2);
    Ok(())
}

#[tokio::test]
async fn event_log_tracks_every_compile_task() -> TestResult {
    init_tracing();
    let director = Director::new(ConfigFileBuilder::new().build());
    let release = ruby_release();
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();
    precompile(&director, &release, "common", &stemcell).await?;
    let job = JobBuilder::new("web", &release, &stemcell)
        .template("app", &["needs_ruby"])
        .build();

    let events = Arc::new(RecordingEventLog::new());
    let mut run = director.compilation(as_jobs(&[job]));
    run.compiler = run.compiler.with_event_log(events.clone());
    with_timeout(run.compiler.perform()).await?;

    assert_eq!(
        events.events(),
        vec![
            format!("stage {COMPILE_STAGE} (2)"),
            "started ruby/1.0".to_string(),
            "finished ruby/1.0".to_string(),
            "started needs_ruby/1.0".to_string(),
            "finished needs_ruby/1.0".to_string(),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn unknown_dependency_fails_before_provisioning() -> TestResult {
    init_tracing();
    let director = Director::new(ConfigFileBuilder::new().build());
    let release = ReleaseBuilder::new("broken")
        .package(PackageBuilder::new("app").depends_on("ghost"))
        .build();
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();
    let job = JobBuilder::new("web", &release, &stemcell)
        .template("app", &["app"])
        .build();

    let mut run = director.compilation(as_jobs(&[job]));
    let err = run.compiler.perform().await.expect_err("should fail");

    assert!(matches!(err, CompileError::UnresolvableDependency { .. }));
    assert!(director.cloud.create_calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn concurrent_directors_compile_each_pair_once() -> TestResult {
    init_tracing();
    let agents = FakeAgentConnector::new().with_compile_delay(Duration::from_millis(100));
    let director = Director::with_agents(ConfigFileBuilder::new().workers(2).build(), agents);
    let release = ruby_release();
    let stemcell = StemcellBuilder::new("ubuntu", "1").build();
    let job_a = JobBuilder::new("web", &release, &stemcell)
        .template("app", &["needs_ruby"])
        .build();
    let job_b = JobBuilder::new("worker", &release, &stemcell)
        .template("app", &["needs_ruby"])
        .build();

    // Both runs share the lock backend and the compiled package store.
    let mut run_a = director.compilation(as_jobs(&[job_a.clone()]));
    let mut run_b = director.compilation(as_jobs(&[job_b.clone()]));
    let (a, b) = with_timeout(async {
        tokio::join!(run_a.compiler.perform(), run_b.compiler.perform())
    })
    .await;
    a?;
    b?;

    assert_eq!(director.agents.compile_calls().len(), 3);
    assert_eq!(director.compiled_packages.all().len(), 3);
    assert_eq!(
        run_a.compiler.compilations_performed() + run_b.compiler.compilations_performed(),
        run_a.compiler.compile_tasks_count()
    );
    assert_eq!(run_b.compiler.compile_tasks_count(), 3);
    assert_eq!(job_a.compiled_packages(), job_b.compiled_packages());
    Ok(())
}
