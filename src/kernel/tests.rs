use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Mutex as StdMutex;

use super::*;
use crate::loader::{ProgramFn, RegistryLoader};
use crate::process::{SIGINT, SIGKILL};
use crate::stream::StreamKind;
use crate::vfs::MemFs;

fn test_kernel() -> (Kernel, Arc<RegistryLoader>, Arc<MemFs>) {
    let loader = RegistryLoader::new();
    let fs = MemFs::new();
    let env = Arc::new(Env::new());
    env.set("PATH", "/bin");
    let kernel = Kernel::new(
        Arc::clone(&loader) as Arc<dyn Loader>,
        Arc::clone(&fs) as Arc<dyn Vfs>,
        env,
        KernelSettings::default(),
    );
    (kernel, loader, fs)
}

/// A task that blocks reading its stdin until EOF or an abort.
fn blocking_reader() -> TaskFn {
    Box::new(|_kernel, proc| {
        Box::pin(async move {
            let stdin = proc
                .stdin()
                .ok_or_else(|| SysError::Io("no stdin".to_string()))?;
            let mut reader = stdin.text_reader()?;
            while reader.read_chunk().await?.is_some() {}
            Ok(0)
        })
    })
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Poll `cond` until it holds or ~1 s passes.
macro_rules! eventually {
    ($cond:expr) => {
        let mut ok = false;
        for _ in 0..1000 {
            if $cond {
                ok = true;
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(1)).await;
        }
        assert!(ok, "condition never held: {}", stringify!($cond));
    };
}

#[tokio::test]
async fn test_simple_exec_writes_stdout_and_is_reaped() {
    let (kernel, _, _) = test_kernel();
    let (sink, source) = StreamPair::channel(StreamKind::Bytes);

    let task: TaskFn = Box::new(|_kernel, proc| {
        Box::pin(async move {
            let stdout = proc
                .stdout()
                .ok_or_else(|| SysError::Io("no stdout".to_string()))?;
            let writer = stdout.text_writer()?;
            writer.write_str("hello\n").await?;
            drop(writer);
            stdout.close().await;
            Ok(0)
        })
    });

    let proc = kernel
        .spawn(
            None,
            "hello",
            task,
            false,
            ProcessIo {
                stdout: Some(sink),
                ..Default::default()
            },
            SpawnOpts::default(),
        )
        .await
        .unwrap();
    let pid = proc.pid;

    assert_eq!(proc.wait().await, 0);
    assert!(kernel.process(pid).await.is_none());

    let mut reader = source.text_reader().unwrap();
    let mut out = String::new();
    while let Some(chunk) = reader.read_chunk().await.unwrap() {
        out.push_str(&chunk);
    }
    assert_eq!(out, "hello\n");
}

#[tokio::test]
async fn test_pids_unique_and_monotonic() {
    let (kernel, _, _) = test_kernel();
    let mut last = 0;
    for i in 0..3 {
        let task: TaskFn = Box::new(|_k, _p| Box::pin(async { Ok(0) }));
        let proc = kernel
            .spawn(None, &format!("p{i}"), task, false, ProcessIo::default(), SpawnOpts::default())
            .await
            .unwrap();
        assert!(proc.pid > last);
        last = proc.pid;
    }
}

#[tokio::test]
async fn test_spawn_returns_handle_before_task_starts() {
    let (kernel, _, _) = test_kernel();
    let flag = Arc::new(AtomicBool::new(false));
    let task_flag = Arc::clone(&flag);
    let task: TaskFn = Box::new(move |_k, _p| {
        Box::pin(async move {
            task_flag.store(true, AtomicOrdering::SeqCst);
            Ok(0)
        })
    });
    let proc = kernel
        .spawn(None, "deferred", task, false, ProcessIo::default(), SpawnOpts::default())
        .await
        .unwrap();
    assert!(!flag.load(AtomicOrdering::SeqCst));
    proc.wait().await;
    assert!(flag.load(AtomicOrdering::SeqCst));
}

#[tokio::test]
async fn test_group_placement_rules() {
    let (kernel, _, _) = test_kernel();

    let parent = kernel
        .spawn(None, "parent", blocking_reader(), false,
            ProcessIo { stdin: Some(StreamPair::channel(StreamKind::Text).1), ..Default::default() },
            SpawnOpts::default())
        .await
        .unwrap();
    // No session, no flags: leaderless parent gets its own group.
    assert_eq!(parent.pgid, parent.pid);

    let inherit = kernel
        .spawn(None, "inherit", Box::new(|_k, _p| Box::pin(async { Ok(0) })), false,
            ProcessIo::default(), SpawnOpts { pgid: None, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(inherit.pgid, inherit.pid);

    let child = kernel
        .spawn(Some(parent.pid), "child", Box::new(|_k, _p| Box::pin(async { Ok(0) })),
            false, ProcessIo::default(), SpawnOpts::default())
        .await
        .unwrap();
    assert_eq!(child.pgid, parent.pgid);

    let leader = kernel
        .spawn(Some(parent.pid), "leader", Box::new(|_k, _p| Box::pin(async { Ok(0) })),
            false, ProcessIo::default(), SpawnOpts { new_group: true, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(leader.pgid, leader.pid);

    let joiner = kernel
        .spawn(Some(parent.pid), "joiner", Box::new(|_k, _p| Box::pin(async { Ok(0) })),
            false, ProcessIo::default(), SpawnOpts { pgid: Some(leader.pid), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(joiner.pgid, leader.pid);
}

#[tokio::test]
async fn test_path_resolution_prefers_earlier_path_entry() {
    let (kernel, _, fs) = test_kernel();
    fs.write("/a/foo", b"x".to_vec(), 0o755).await.unwrap();
    fs.write("/b/foo.js", b"x".to_vec(), 0o755).await.unwrap();

    let env = Env::new();
    env.set("PATH", "/a:/b");

    let kernel = Kernel::new(
        RegistryLoader::new() as Arc<dyn Loader>,
        Arc::clone(&fs) as Arc<dyn Vfs>,
        kernel.root_env(),
        KernelSettings {
            exec_extensions: vec![String::new(), ".js".to_string()],
            ..Default::default()
        },
    );

    // /a/foo (no extension, earlier PATH entry) wins over /b/foo.js.
    assert_eq!(
        kernel.resolve_executable("/", &env, "foo").await.unwrap(),
        "/a/foo"
    );
}

#[tokio::test]
async fn test_path_resolution_probes_extensions() {
    let loader = RegistryLoader::new();
    let fs = MemFs::new();
    fs.write("/b/foo.js", b"x".to_vec(), 0o755).await.unwrap();
    let kernel = Kernel::new(
        loader as Arc<dyn Loader>,
        Arc::clone(&fs) as Arc<dyn Vfs>,
        Arc::new(Env::new()),
        KernelSettings {
            exec_extensions: vec![String::new(), ".js".to_string()],
            ..Default::default()
        },
    );
    let env = Env::new();
    env.set("PATH", "/a:/b");
    assert_eq!(
        kernel.resolve_executable("/", &env, "foo").await.unwrap(),
        "/b/foo.js"
    );
    // Relative candidates with a slash resolve against the CWD.
    assert_eq!(
        kernel.resolve_executable("/b", &env, "./foo").await.unwrap(),
        "/b/foo.js"
    );
    assert_eq!(
        kernel.resolve_executable("/", &env, "missing").await.unwrap_err(),
        SysError::CommandNotFound("missing".to_string())
    );
}

#[tokio::test]
async fn test_start_process_surfaces_loader_errors() {
    let (kernel, _, fs) = test_kernel();
    // Not on disk at all → CommandNotFound.
    let err = kernel
        .start_process(None, "/bin/ghost", vec![], false, ProcessIo::default(), SpawnOpts::default())
        .await
        .unwrap_err();
    assert_eq!(err, SysError::CommandNotFound("/bin/ghost".to_string()));

    // On disk but not registered → NoEntryPoint.
    fs.write("/bin/husk", b"".to_vec(), 0o755).await.unwrap();
    let err = kernel
        .start_process(None, "/bin/husk", vec![], false, ProcessIo::default(), SpawnOpts::default())
        .await
        .unwrap_err();
    assert_eq!(err, SysError::NoEntryPoint("/bin/husk".to_string()));
}

#[tokio::test]
async fn test_exec_path_runs_program_and_releases_modules() {
    let (kernel, loader, fs) = test_kernel();
    fs.write("/bin/tool", b"".to_vec(), 0o755).await.unwrap();
    let program: ProgramFn =
        Arc::new(|args, _kernel, _proc| Box::pin(async move { Ok(args.len() as i32) }));
    loader.register("/bin/tool", &["/lib/rt"], program);

    let code = kernel
        .exec_path(
            None,
            "tool",
            vec!["a".to_string(), "b".to_string()],
            true,
            ProcessIo::default(),
            SpawnOpts::default(),
        )
        .await
        .unwrap();
    assert_eq!(code, 2);

    // The cleanup hook released the module refs.
    eventually!(loader.live_count("/bin/tool") == 0);
    assert_eq!(loader.live_count("/lib/rt"), 0);
}

#[tokio::test]
async fn test_task_error_reports_to_stderr_and_exits_1() {
    let (kernel, _, _) = test_kernel();
    let (err_sink, err_source) = StreamPair::channel(StreamKind::Bytes);
    let task: TaskFn = Box::new(|_k, _p| {
        Box::pin(async { Err(SysError::Io("flux capacitor offline".to_string())) })
    });
    let proc = kernel
        .spawn(
            None,
            "broken",
            task,
            false,
            ProcessIo {
                stderr: Some(err_sink),
                ..Default::default()
            },
            SpawnOpts::default(),
        )
        .await
        .unwrap();
    assert_eq!(proc.wait().await, 1);
    let mut reader = err_source.text_reader().unwrap();
    let diag = reader.read_chunk().await.unwrap().unwrap();
    assert!(diag.contains("flux capacitor offline"));
}

#[tokio::test]
async fn test_task_panic_exits_1() {
    let (kernel, _, _) = test_kernel();
    let task: TaskFn = Box::new(|_k, _p| {
        Box::pin(async {
            panic!("unhinged program");
        })
    });
    let proc = kernel
        .spawn(None, "panicky", task, false, ProcessIo::default(), SpawnOpts::default())
        .await
        .unwrap();
    assert_eq!(proc.wait().await, 1);
}

#[tokio::test]
async fn test_ctrl_c_interrupts_blocking_read() {
    let (kernel, _, _) = test_kernel();
    let (host_in_sink, host_in) = StreamPair::channel(StreamKind::Bytes);
    let (host_out, host_out_source) = StreamPair::channel(StreamKind::Bytes);

    let proc = kernel
        .spawn(
            None,
            "reader",
            blocking_reader(),
            true,
            ProcessIo {
                stdin: Some(host_in),
                stdout: Some(host_out),
                ..Default::default()
            },
            SpawnOpts {
                new_session: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    settle().await;

    // Type Ctrl-C on the physical input.
    let keys = host_in_sink.byte_writer().unwrap();
    keys.write(&[0x03]).await.unwrap();

    assert_eq!(proc.wait().await, 130);

    let mut out = host_out_source.text_reader().unwrap();
    assert_eq!(out.read_chunk().await.unwrap().unwrap(), "^C\r\n");
}

#[tokio::test]
async fn test_ctrl_z_suspends_group_and_returns_terminal_to_leader() {
    let (kernel, _, _) = test_kernel();
    let (host_in_sink, host_in) = StreamPair::channel(StreamKind::Bytes);
    let (host_out, _host_out_source) = StreamPair::channel(StreamKind::Bytes);

    let leader = kernel
        .spawn(
            None,
            "shell",
            blocking_reader(),
            true,
            ProcessIo {
                stdin: Some(host_in),
                stdout: Some(host_out),
                ..Default::default()
            },
            SpawnOpts {
                new_session: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let job = kernel
        .spawn(
            Some(leader.pid),
            "job",
            blocking_reader(),
            true,
            ProcessIo::default(),
            SpawnOpts {
                new_group: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    settle().await;

    // The new foreground group pushed the leader into the background.
    assert_eq!(kernel.get_foreground_pgid(leader.pid).await, Some(job.pgid));
    assert_eq!(leader.state().await, ProcessState::Suspended);

    // Type Ctrl-Z.
    let keys = host_in_sink.byte_writer().unwrap();
    keys.write(&[0x1A]).await.unwrap();

    eventually!(job.state().await == ProcessState::Suspended);
    eventually!(leader.state().await == ProcessState::Running);
    assert_eq!(kernel.get_foreground_pgid(leader.pid).await, Some(leader.pid));

    // The suspended group's input stream survives, so it can be resumed.
    let tty = kernel.session_tty(leader.pid).await.unwrap();
    assert!(tty.has_subscriber(job.pgid).await);
    kernel.set_foreground_pgid(leader.pid, job.pgid).await;
    assert_eq!(kernel.get_foreground_pgid(leader.pid).await, Some(job.pgid));
}

#[tokio::test]
async fn test_sigint_to_foreground_restores_leader() {
    let (kernel, _, _) = test_kernel();
    let (_host_in_sink, host_in) = StreamPair::channel(StreamKind::Bytes);
    let (host_out, _host_out_source) = StreamPair::channel(StreamKind::Bytes);

    let leader = kernel
        .spawn(
            None, "shell", blocking_reader(), true,
            ProcessIo { stdin: Some(host_in), stdout: Some(host_out), ..Default::default() },
            SpawnOpts { new_session: true, ..Default::default() },
        )
        .await
        .unwrap();
    let job = kernel
        .spawn(
            Some(leader.pid), "job", blocking_reader(), true,
            ProcessIo::default(),
            SpawnOpts { new_group: true, ..Default::default() },
        )
        .await
        .unwrap();
    settle().await;

    kernel.signal_foreground(leader.pid, SIGINT).await;
    assert_eq!(job.wait().await, 130);

    eventually!(kernel.get_foreground_pgid(leader.pid).await == Some(leader.pid));
    eventually!(kernel.process(job.pid).await.is_none());
    eventually!(leader.state().await == ProcessState::Running);
}

#[tokio::test]
async fn test_pipe_between_processes_preserves_order_and_eof() {
    let (kernel, _, _) = test_kernel();
    let (sink, source) = StreamPair::channel(StreamKind::Text);

    let writer_task: TaskFn = Box::new(|_k, proc| {
        Box::pin(async move {
            let stdout = proc
                .stdout()
                .ok_or_else(|| SysError::Io("no stdout".to_string()))?;
            let writer = stdout.text_writer()?;
            for line in ["1\n", "2\n", "3\n"] {
                writer.write_str(line).await?;
            }
            drop(writer);
            stdout.close().await;
            Ok(0)
        })
    });

    let collected: Arc<StdMutex<String>> = Arc::new(StdMutex::new(String::new()));
    let sink_collected = Arc::clone(&collected);
    let reader_task: TaskFn = Box::new(move |_k, proc| {
        Box::pin(async move {
            let stdin = proc
                .stdin()
                .ok_or_else(|| SysError::Io("no stdin".to_string()))?;
            let mut reader = stdin.text_reader()?;
            while let Some(chunk) = reader.read_chunk().await? {
                sink_collected.lock().unwrap().push_str(&chunk);
            }
            Ok(0)
        })
    });

    let a = kernel
        .spawn(None, "producer", writer_task, false,
            ProcessIo { stdout: Some(sink), ..Default::default() }, SpawnOpts::default())
        .await
        .unwrap();
    let b = kernel
        .spawn(None, "consumer", reader_task, false,
            ProcessIo { stdin: Some(source), ..Default::default() }, SpawnOpts::default())
        .await
        .unwrap();

    assert_eq!(a.wait().await, 0);
    assert_eq!(b.wait().await, 0);
    assert_eq!(*collected.lock().unwrap(), "1\n2\n3\n");
}

#[tokio::test]
async fn test_session_pid_env_and_membership() {
    let (kernel, _, _) = test_kernel();
    let (_host_in_sink, host_in) = StreamPair::channel(StreamKind::Bytes);
    let (host_out, _host_out_source) = StreamPair::channel(StreamKind::Bytes);

    let leader = kernel
        .spawn(
            None, "shell", blocking_reader(), true,
            ProcessIo { stdin: Some(host_in), stdout: Some(host_out), ..Default::default() },
            SpawnOpts { new_session: true, ..Default::default() },
        )
        .await
        .unwrap();
    assert_eq!(leader.session, leader.pid);
    assert_eq!(leader.env.get("SESSION_PID"), leader.pid.to_string());

    let child = kernel
        .spawn(
            Some(leader.pid), "child", Box::new(|_k, _p| Box::pin(async { Ok(0) })),
            true, ProcessIo::default(), SpawnOpts::default(),
        )
        .await
        .unwrap();
    assert_eq!(child.session, leader.pid);
    assert_eq!(child.env.get("SESSION_PID"), leader.pid.to_string());
}

#[tokio::test]
async fn test_tty_mode_switch_via_stdin_hook_and_facade() {
    let (kernel, _, _) = test_kernel();
    let (_host_in_sink, host_in) = StreamPair::channel(StreamKind::Bytes);
    let (host_out, _host_out_source) = StreamPair::channel(StreamKind::Bytes);

    let leader = kernel
        .spawn(
            None, "shell", blocking_reader(), true,
            ProcessIo { stdin: Some(host_in), stdout: Some(host_out), ..Default::default() },
            SpawnOpts { new_session: true, ..Default::default() },
        )
        .await
        .unwrap();

    let tty = kernel.session_tty(leader.pid).await.unwrap();
    assert_eq!(tty.mode(), TtyMode::Cooked);

    // A program flips its terminal to raw through its stdin handle.
    leader.stdin().unwrap().request_mode(TtyMode::Raw);
    assert_eq!(tty.mode(), TtyMode::Raw);

    kernel.set_tty_mode(leader.pid, TtyMode::Cooked).await;
    assert_eq!(tty.mode(), TtyMode::Cooked);
}

#[tokio::test]
async fn test_archiver_facade_uses_process_fs_view() {
    let (kernel, _, fs) = test_kernel();
    fs.write("/data/report.txt", b"quarterly".to_vec(), 0o777)
        .await
        .unwrap();

    let task: TaskFn = Box::new(|kernel, proc| {
        Box::pin(async move {
            let archiver = kernel.create_archiver(&proc);
            let bytes = archiver.pack(&["/data".to_string()]).await?;
            archiver.unpack(&bytes, "/backup").await?;
            Ok(0)
        })
    });
    let proc = kernel
        .spawn(None, "backup", task, false, ProcessIo::default(), SpawnOpts::default())
        .await
        .unwrap();
    assert_eq!(proc.wait().await, 0);
    assert_eq!(fs.read("/backup/data/report.txt").await.unwrap(), b"quarterly");
}

#[tokio::test]
async fn test_shutdown_reaps_everything() {
    let (kernel, _, _) = test_kernel();
    let mut procs = Vec::new();
    for i in 0..2 {
        let (_sink, source) = StreamPair::channel(StreamKind::Text);
        let proc = kernel
            .spawn(None, &format!("d{i}"), blocking_reader(), false,
                ProcessIo { stdin: Some(source), ..Default::default() }, SpawnOpts::default())
            .await
            .unwrap();
        procs.push(proc);
    }
    settle().await;

    kernel.shutdown().await;
    for proc in procs {
        assert_eq!(proc.wait().await, 128 + SIGKILL);
    }
    assert!(kernel.list_processes().await.is_empty());
}
