//! End-to-end lifecycle tests against scripted collaborators.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bytes::Bytes;
use pretty_assertions::assert_eq;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use gate_core::api::{
    Cause, DebugConfig, DebugOp, DebugRequest, LaunchOptions, ModuleOptions, ModuleUpload, State,
};
use gate_core::builder::{hash_module_bytes, ModuleLoader};
use gate_core::image::storage::ImageStorage;
use gate_core::image::{InstanceImage, ProgramImage};
use gate_core::server::access::OpContext;
use gate_core::server::events::EventType;
use gate_core::server::Server;
use gate_core::types::{Config, Error, InstanceId, PrincipalId, Result};

use common::{
    FakeLoader, FakeProcessFactory, FakeServiceFactory, RecordingMonitor, SlowStorage, GREETING,
};

struct Harness {
    server: Server,
    processes: Arc<FakeProcessFactory>,
    monitor: Arc<RecordingMonitor>,
}

async fn harness() -> Harness {
    harness_with(Arc::new(FakeLoader), None).await
}

async fn harness_with(
    loader: Arc<dyn ModuleLoader>,
    storage: Option<Arc<dyn ImageStorage>>,
) -> Harness {
    let processes = Arc::new(FakeProcessFactory::default());
    let services = Arc::new(FakeServiceFactory::sharing_stdout(&processes));
    let monitor = Arc::new(RecordingMonitor::default());
    let mut builder = Server::builder(Config::default())
        .loader(loader)
        .process_factory(processes.clone())
        .service_factory(services)
        .monitor(monitor.clone());
    if let Some(storage) = storage {
        builder = builder.storage(storage);
    }
    let server = builder.build().await.unwrap();
    Harness {
        server,
        processes,
        monitor,
    }
}

/// Loader that parks any rebuild for the given breakpoint set until
/// released, so a test can interleave another request mid-rebuild.
struct GatedLoader {
    parked_on: Vec<u64>,
    entered: AtomicBool,
    open: Mutex<bool>,
    released: Condvar,
}

impl GatedLoader {
    fn new(parked_on: Vec<u64>) -> Self {
        Self {
            parked_on,
            entered: AtomicBool::new(false),
            open: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    async fn wait_entered(&self) {
        while !self.entered.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.released.notify_all();
    }
}

impl ModuleLoader for GatedLoader {
    fn load(&self, module: Bytes, breakpoints: &[u64]) -> Result<ProgramImage> {
        if breakpoints == self.parked_on.as_slice() {
            self.entered.store(true, Ordering::SeqCst);
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.released.wait(open).unwrap();
            }
        }
        FakeLoader.load(module, breakpoints)
    }

    fn snapshot(&self, program: &ProgramImage, instance: &InstanceImage) -> Result<Bytes> {
        FakeLoader.snapshot(program, instance)
    }
}

fn module_bytes() -> &'static [u8] {
    b"\0asm\x01\0\0\0 test module"
}

#[tokio::test]
async fn test_upload_call_terminate_anonymous() {
    let h = harness().await;
    let mut ctx = OpContext::anonymous("test");

    let launch = LaunchOptions {
        function: "main".to_string(),
        transient: true,
        ..LaunchOptions::default()
    };
    let (_, info) = h
        .server
        .upload_module_instance(
            &mut ctx,
            ModuleUpload::from_bytes(module_bytes()),
            ModuleOptions::default(),
            launch,
        )
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let status = h
        .server
        .wait_instance(&mut ctx, &info.instance, &cancel)
        .await
        .unwrap();
    assert_eq!(status.state, State::Terminated);
    assert_eq!(status.cause, Cause::Normal);
    assert_eq!(status.result, 0);
    assert_eq!(h.processes.stdout(), GREETING);

    // Transient: the instance is already gone once the wait returns.
    let err = h
        .server
        .instance_info(&mut ctx, &info.instance)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InstanceNotFound));
}

#[tokio::test]
async fn test_upload_pin_list() {
    let h = harness().await;
    let mut ctx = OpContext::for_principal("test", PrincipalId::local("alice"));

    let expected = hash_module_bytes(module_bytes());
    let mut upload = ModuleUpload::from_bytes(module_bytes());
    upload.hash = expected.as_str().to_string();

    let id = h
        .server
        .upload_module(
            &mut ctx,
            upload,
            ModuleOptions {
                pin: true,
                tags: vec!["x".to_string()],
            },
        )
        .await
        .unwrap();
    assert_eq!(id, expected);

    let modules = h.server.modules(&mut ctx).await.unwrap();
    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0].id, expected);
    assert_eq!(modules[0].tags, vec!["x".to_string()]);

    // Re-pin with different tags: exactly one pin event with one tag.
    h.server
        .pin_module(
            &mut ctx,
            &id,
            ModuleOptions {
                pin: true,
                tags: vec!["y".to_string()],
            },
        )
        .await
        .unwrap();
    assert_eq!(h.monitor.count(EventType::ModulePin), 1);
    let events = h.monitor.events();
    let pin = events
        .iter()
        .find(|e| e.typ == EventType::ModulePin)
        .unwrap();
    assert_eq!(pin.module.as_ref().unwrap().tag_count, Some(1));

    // Identical repeat pin is a no-op.
    h.server
        .pin_module(
            &mut ctx,
            &id,
            ModuleOptions {
                pin: true,
                tags: vec!["y".to_string()],
            },
        )
        .await
        .unwrap();
    assert_eq!(h.monitor.count(EventType::ModulePin), 1);
}

#[tokio::test]
async fn test_suspend_snapshot_resume() {
    let h = harness().await;
    let mut ctx = OpContext::for_principal("test", PrincipalId::local("alice"));

    let launch = LaunchOptions {
        function: "loop".to_string(),
        ..LaunchOptions::default()
    };
    let (module, info) = h
        .server
        .upload_module_instance(
            &mut ctx,
            ModuleUpload::from_bytes(module_bytes()),
            ModuleOptions::default(),
            launch,
        )
        .await
        .unwrap();
    assert_eq!(info.status.state, State::Running);

    tokio::time::sleep(Duration::from_millis(50)).await;
    h.server
        .suspend_instance(&mut ctx, &info.instance)
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    let status = h
        .server
        .wait_instance(&mut ctx, &info.instance, &cancel)
        .await
        .unwrap();
    assert_eq!(status.state, State::Suspended);
    assert_eq!(status.cause, Cause::Normal);

    // Snapshot yields a distinct module.
    let snapshot = h
        .server
        .snapshot(&mut ctx, &info.instance, ModuleOptions::default())
        .await
        .unwrap();
    assert_ne!(snapshot, module);

    // A fresh instance of the snapshot runs and can be suspended again.
    let resumed = h
        .server
        .new_instance(&mut ctx, &snapshot, LaunchOptions::default())
        .await
        .unwrap();
    assert_eq!(resumed.status.state, State::Running);
    h.server
        .suspend_instance(&mut ctx, &resumed.instance)
        .await
        .unwrap();
    let status = h
        .server
        .wait_instance(&mut ctx, &resumed.instance, &cancel)
        .await
        .unwrap();
    assert_eq!(status.state, State::Suspended);

    // The original instance resumes its loop.
    let info = h
        .server
        .resume_instance(&mut ctx, &info.instance, Default::default())
        .await
        .unwrap();
    assert_eq!(info.status.state, State::Running);
    h.server
        .suspend_instance(&mut ctx, &info.instance)
        .await
        .unwrap();
    let status = h
        .server
        .wait_instance(&mut ctx, &info.instance, &cancel)
        .await
        .unwrap();
    assert_eq!(status.state, State::Suspended);
}

#[tokio::test]
async fn test_breakpoint_debug_rebuild() {
    let h = harness().await;
    let mut ctx = OpContext::for_principal("test", PrincipalId::local("alice"));

    let launch = LaunchOptions {
        function: "loop".to_string(),
        ..LaunchOptions::default()
    };
    let (_, info) = h
        .server
        .upload_module_instance(
            &mut ctx,
            ModuleUpload::from_bytes(module_bytes()),
            ModuleOptions::default(),
            launch,
        )
        .await
        .unwrap();

    h.server
        .suspend_instance(&mut ctx, &info.instance)
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    let status = h
        .server
        .wait_instance(&mut ctx, &info.instance, &cancel)
        .await
        .unwrap();
    assert_eq!(status.state, State::Suspended);

    let resp = h
        .server
        .debug_instance(
            &mut ctx,
            &info.instance,
            DebugRequest {
                op: DebugOp::ConfigUnion,
                config: DebugConfig {
                    breakpoints: vec![0x42],
                },
            },
        )
        .await
        .unwrap();
    assert_eq!(resp.config.breakpoints, vec![0x42]);

    let resp = h
        .server
        .debug_instance(
            &mut ctx,
            &info.instance,
            DebugRequest {
                op: DebugOp::ReadStack,
                config: DebugConfig::default(),
            },
        )
        .await
        .unwrap();
    // One frame, suspended inside the loop function (index 2).
    assert_eq!(resp.data, [2u8, 0, 0, 0]);
}

#[tokio::test]
async fn test_wrong_hash_rejected() {
    let h = harness().await;
    let mut ctx = OpContext::for_principal("test", PrincipalId::local("alice"));

    let mut upload = ModuleUpload::from_bytes(module_bytes());
    upload.hash = "a".repeat(64);
    let err = h
        .server
        .upload_module(&mut ctx, upload, ModuleOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ModuleHashMismatch));

    // No module event besides the failure report.
    assert_eq!(h.monitor.count(EventType::FailRequest), 1);
    assert_eq!(h.monitor.count(EventType::ModuleUploadNew), 0);
    assert_eq!(h.monitor.count(EventType::ModuleUploadExist), 0);

    // A subsequent correct upload is new, proving nothing was inserted.
    let id = h
        .server
        .upload_module(
            &mut ctx,
            ModuleUpload::from_bytes(module_bytes()),
            ModuleOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(id, hash_module_bytes(module_bytes()));
    assert_eq!(h.monitor.count(EventType::ModuleUploadNew), 1);
}

#[tokio::test]
async fn test_shutdown_drains_running_instances() {
    let h = harness().await;
    let mut ctx = OpContext::for_principal("test", PrincipalId::local("alice"));

    let module = h
        .server
        .upload_module(
            &mut ctx,
            ModuleUpload::from_bytes(module_bytes()),
            ModuleOptions::default(),
        )
        .await
        .unwrap();
    for _ in 0..3 {
        let launch = LaunchOptions {
            function: "loop".to_string(),
            ..LaunchOptions::default()
        };
        let info = h.server.new_instance(&mut ctx, &module, launch).await.unwrap();
        assert_eq!(info.status.state, State::Running);
    }

    h.server.shutdown(&CancellationToken::new()).await.unwrap();

    // The server refuses further operations, reads included.
    let err = h.server.modules(&mut ctx).await.unwrap_err();
    assert!(matches!(err, Error::ServerClosed));
    let err = h.server.instances(&mut ctx).await.unwrap_err();
    assert!(matches!(err, Error::ServerClosed));
}

#[tokio::test]
async fn test_duplicate_instance_id_single_winner() {
    let h = harness().await;
    let module = {
        let mut ctx = OpContext::for_principal("test", PrincipalId::local("alice"));
        h.server
            .upload_module(
                &mut ctx,
                ModuleUpload::from_bytes(module_bytes()),
                ModuleOptions::default(),
            )
            .await
            .unwrap()
    };

    let id = InstanceId::new();
    let mut tasks = Vec::new();
    for _ in 0..5 {
        let server = h.server.clone();
        let module = module.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            let mut ctx = OpContext::for_principal("test", PrincipalId::local("alice"));
            let launch = LaunchOptions {
                instance: Some(id),
                suspend: true,
                ..LaunchOptions::default()
            };
            server.new_instance(&mut ctx, &module, launch).await
        }));
    }

    let mut ok = 0;
    let mut exists = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(Error::InstanceIdExists) => exists += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(exists, 4);
}

#[tokio::test]
async fn test_module_content_round_trip() {
    let h = harness().await;
    let mut ctx = OpContext::for_principal("test", PrincipalId::local("alice"));

    let id = h
        .server
        .upload_module(
            &mut ctx,
            ModuleUpload::from_bytes(module_bytes()),
            ModuleOptions::default(),
        )
        .await
        .unwrap();
    let content = h.server.module_content(&mut ctx, &id).await.unwrap();
    assert_eq!(content.as_ref(), module_bytes());
}

#[tokio::test]
async fn test_unpin_unpinned_module() {
    let h = harness().await;
    let mut ctx = OpContext::for_principal("test", PrincipalId::local("alice"));

    let id = h
        .server
        .upload_module(
            &mut ctx,
            ModuleUpload::from_bytes(module_bytes()),
            ModuleOptions::default(),
        )
        .await
        .unwrap();
    let err = h.server.unpin_module(&mut ctx, &id).await.unwrap_err();
    assert!(matches!(err, Error::ModuleNotFound));
}

#[tokio::test]
async fn test_kill_transient_instance_cleanup() {
    let h = harness().await;
    let mut ctx = OpContext::for_principal("test", PrincipalId::local("alice"));

    let launch = LaunchOptions {
        function: "loop".to_string(),
        transient: true,
        ..LaunchOptions::default()
    };
    let (_, info) = h
        .server
        .upload_module_instance(
            &mut ctx,
            ModuleUpload::from_bytes(module_bytes()),
            ModuleOptions::default(),
            launch,
        )
        .await
        .unwrap();

    h.server.kill_instance(&mut ctx, &info.instance).await.unwrap();
    let cancel = CancellationToken::new();
    let status = h
        .server
        .wait_instance(&mut ctx, &info.instance, &cancel)
        .await
        .unwrap();
    assert_eq!(status.state, State::Killed);
    assert_eq!(status.cause, Cause::Normal);

    let err = h
        .server
        .instance_info(&mut ctx, &info.instance)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InstanceNotFound));
}

#[tokio::test]
async fn test_resume_requires_suspension() {
    let h = harness().await;
    let mut ctx = OpContext::for_principal("test", PrincipalId::local("alice"));

    let launch = LaunchOptions {
        function: "loop".to_string(),
        ..LaunchOptions::default()
    };
    let (_, info) = h
        .server
        .upload_module_instance(
            &mut ctx,
            ModuleUpload::from_bytes(module_bytes()),
            ModuleOptions::default(),
            launch,
        )
        .await
        .unwrap();

    let err = h
        .server
        .resume_instance(&mut ctx, &info.instance, Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InstanceStatus(_)));
}

#[tokio::test]
async fn test_pin_requires_reachable_module() {
    let h = harness().await;
    let mut bob = OpContext::for_principal("test", PrincipalId::local("bob"));

    let id = h
        .server
        .upload_module(
            &mut bob,
            ModuleUpload::from_bytes(module_bytes()),
            ModuleOptions {
                pin: true,
                tags: vec![],
            },
        )
        .await
        .unwrap();

    // The program is live on the server, but alice neither pins it nor
    // owns an instance of it.
    let mut alice = OpContext::for_principal("test", PrincipalId::local("alice"));
    let err = h
        .server
        .pin_module(
            &mut alice,
            &id,
            ModuleOptions {
                pin: true,
                tags: vec![],
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ModuleNotFound));
}

#[tokio::test]
async fn test_suspend_launch_rejects_function() {
    let h = harness().await;
    let mut ctx = OpContext::for_principal("test", PrincipalId::local("alice"));

    let id = h
        .server
        .upload_module(
            &mut ctx,
            ModuleUpload::from_bytes(module_bytes()),
            ModuleOptions {
                pin: true,
                tags: vec![],
            },
        )
        .await
        .unwrap();

    let launch = LaunchOptions {
        function: "loop".to_string(),
        suspend: true,
        ..LaunchOptions::default()
    };
    let err = h.server.new_instance(&mut ctx, &id, launch).await.unwrap_err();
    assert!(matches!(err, Error::InstanceStatus(_)));
}

#[tokio::test]
async fn test_known_hash_length_mismatch() {
    let h = harness().await;
    let mut ctx = OpContext::for_principal("test", PrincipalId::local("alice"));

    let expected = hash_module_bytes(module_bytes());
    let mut upload = ModuleUpload::from_bytes(module_bytes());
    upload.hash = expected.as_str().to_string();
    h.server
        .upload_module(
            &mut ctx,
            upload,
            ModuleOptions {
                pin: true,
                tags: vec![],
            },
        )
        .await
        .unwrap();

    // Alleging a known hash with the wrong length is rejected before the
    // content is read.
    let mut short = ModuleUpload::from_bytes(&module_bytes()[..4]);
    short.hash = expected.as_str().to_string();
    let err = h
        .server
        .upload_module(&mut ctx, short, ModuleOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ModuleError(_)));
}

#[tokio::test]
async fn test_wait_observes_driver_side_effects() {
    let storage = Arc::new(SlowStorage::new(Duration::from_millis(300)));
    let h = harness_with(Arc::new(FakeLoader), Some(storage)).await;
    let mut ctx = OpContext::for_principal("test", PrincipalId::local("alice"));

    let launch = LaunchOptions {
        function: "loop".to_string(),
        ..LaunchOptions::default()
    };
    let (_, info) = h
        .server
        .upload_module_instance(
            &mut ctx,
            ModuleUpload::from_bytes(module_bytes()),
            ModuleOptions::default(),
            launch,
        )
        .await
        .unwrap();

    h.server
        .suspend_instance(&mut ctx, &info.instance)
        .await
        .unwrap();

    // The image write is slow; the instance stays observable meanwhile.
    let observed = tokio::time::timeout(
        Duration::from_millis(150),
        h.server.instance_info(&mut ctx, &info.instance),
    )
    .await;
    assert!(observed.is_ok(), "instance_info blocked behind the image write");

    // A wait that returns a non-Running status has the storage write and
    // the stop event behind it.
    let cancel = CancellationToken::new();
    let status = h
        .server
        .wait_instance(&mut ctx, &info.instance, &cancel)
        .await
        .unwrap();
    assert_eq!(status.state, State::Suspended);
    assert_eq!(h.monitor.count(EventType::InstanceStop), 1);
}

#[tokio::test]
async fn test_connect_round_trip() {
    let h = harness().await;
    let mut ctx = OpContext::for_principal("test", PrincipalId::local("alice"));

    // A completed main run leaves the greeting in the program's output.
    let launch = LaunchOptions {
        function: "main".to_string(),
        transient: true,
        ..LaunchOptions::default()
    };
    let (module, info) = h
        .server
        .upload_module_instance(
            &mut ctx,
            ModuleUpload::from_bytes(module_bytes()),
            ModuleOptions::default(),
            launch,
        )
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    h.server
        .wait_instance(&mut ctx, &info.instance, &cancel)
        .await
        .unwrap();

    let launch = LaunchOptions {
        function: "loop".to_string(),
        ..LaunchOptions::default()
    };
    let info = h.server.new_instance(&mut ctx, &module, launch).await.unwrap();

    let (mut client, server_io) = tokio::io::duplex(256);
    let (rx, tx) = tokio::io::split(server_io);
    h.server
        .instance_connect(
            &mut ctx,
            &info.instance,
            CancellationToken::new(),
            Box::pin(rx),
            Box::pin(tx),
        )
        .await
        .unwrap();

    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, GREETING);
    assert_eq!(h.monitor.count(EventType::InstanceConnect), 1);
    assert_eq!(h.monitor.count(EventType::InstanceDisconnect), 1);

    // A stopped instance refuses connections.
    h.server
        .suspend_instance(&mut ctx, &info.instance)
        .await
        .unwrap();
    h.server
        .wait_instance(&mut ctx, &info.instance, &cancel)
        .await
        .unwrap();
    let (_client, server_io) = tokio::io::duplex(64);
    let (rx, tx) = tokio::io::split(server_io);
    let err = h
        .server
        .instance_connect(
            &mut ctx,
            &info.instance,
            CancellationToken::new(),
            Box::pin(rx),
            Box::pin(tx),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InstanceNoConnect));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_debug_rebuild_conflict() {
    let loader = Arc::new(GatedLoader::new(vec![0x42]));
    let h = harness_with(loader.clone(), None).await;
    let mut ctx = OpContext::for_principal("test", PrincipalId::local("alice"));

    let launch = LaunchOptions {
        function: "loop".to_string(),
        ..LaunchOptions::default()
    };
    let (_, info) = h
        .server
        .upload_module_instance(
            &mut ctx,
            ModuleUpload::from_bytes(module_bytes()),
            ModuleOptions::default(),
            launch,
        )
        .await
        .unwrap();
    h.server
        .suspend_instance(&mut ctx, &info.instance)
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    let status = h
        .server
        .wait_instance(&mut ctx, &info.instance, &cancel)
        .await
        .unwrap();
    assert_eq!(status.state, State::Suspended);

    let server = h.server.clone();
    let id = info.instance.clone();
    let parked = tokio::spawn(async move {
        let mut ctx = OpContext::for_principal("test", PrincipalId::local("alice"));
        server
            .debug_instance(
                &mut ctx,
                &id,
                DebugRequest {
                    op: DebugOp::ConfigSet,
                    config: DebugConfig {
                        breakpoints: vec![0x42],
                    },
                },
            )
            .await
    });
    loader.wait_entered().await;

    // A second request lands while the first rebuild is parked.
    let resp = h
        .server
        .debug_instance(
            &mut ctx,
            &info.instance,
            DebugRequest {
                op: DebugOp::ConfigSet,
                config: DebugConfig {
                    breakpoints: vec![0x43],
                },
            },
        )
        .await
        .unwrap();
    assert_eq!(resp.config.breakpoints, vec![0x43]);

    loader.release();
    let err = parked.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::InstanceDebugState(_)));
}

#[tokio::test]
async fn test_shutdown_cancelled_drain() {
    let h = harness().await;
    let mut ctx = OpContext::for_principal("test", PrincipalId::local("alice"));

    // `stall` ignores suspension, so the drain can only end at the deadline
    // or by cancellation.
    let launch = LaunchOptions {
        function: "stall".to_string(),
        ..LaunchOptions::default()
    };
    let (_, info) = h
        .server
        .upload_module_instance(
            &mut ctx,
            ModuleUpload::from_bytes(module_bytes()),
            ModuleOptions::default(),
            launch,
        )
        .await
        .unwrap();
    assert_eq!(info.status.state, State::Running);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h.server.shutdown(&cancel).await.unwrap_err();
    assert!(matches!(err, Error::Unavailable(_)));
}
