//! Synth responses and the VM-backend director pipeline.

mod guestlib;

use guestlib::*;
use tenvm_contracts::{BytesBody, HttpWhere, PullStatus, VclCtx, HDR_INVALID};
use tenvm_machine::ScriptedProgram;
use tenvm_runtime::{vcl, Director, Hook, Syscall, VclAction};

#[test]
fn hello_synth() {
    let bed = TestBed::new();
    let prog = HookProgram::new()
        .hook(Hook::Recv, |gc| {
            sys_synth(gc, 200, "text/plain", b"hi")?;
            Ok(-1)
        })
        .build();
    bed.install("synth.example.com", "hello-synth", prog);

    let mut ctx = VclCtx::for_request("GET", "/any");
    let mut state = bed.fork(&mut ctx, "synth.example.com");
    // The synth trap halts the call with the status in a0.
    assert_eq!(vcl::vcall(&mut ctx, &mut state, Hook::Recv), 200);
    assert_eq!(vcl::want_result(&state), "synth");
    assert_eq!(vcl::want_status(&state), 200);
    assert_eq!(vcl::decision_action(&state), VclAction::Synth(200));

    let synth = vcl::synth_body(&state).expect("synth body recorded");
    assert_eq!(synth.ctype, "text/plain");
    assert_eq!(synth.body, b"hi");
}

/// Generator echoing the POST body back as application/json.
fn echo_backend() -> ScriptedProgram {
    HookProgram::new()
        .hook(Hook::Recv, |_| Ok(0))
        .func("echo_backend", |gc| {
            let post_addr = gc.arg(1);
            let post_len = gc.arg(2) as usize;
            let body = gc.read(post_addr, post_len)?;
            sys_forge(gc, 200, "application/json", &body)?;
            Ok(-1)
        })
        .build()
}

#[test]
fn vm_backend_echoes_post_body() {
    let bed = TestBed::new();
    bed.install("be.example.com", "echo-be", echo_backend());

    let mut ctx = VclCtx::for_request("POST", "/api");
    let state = bed.fork(&mut ctx, "be.example.com");
    let funcaddr = state
        .script
        .as_ref()
        .unwrap()
        .instance()
        .resolve_address("echo_backend")
        .unwrap();

    let mut bctx = VclCtx::for_backend("POST", "/api");
    let mut state = state;
    let director = vcl::vm_backend(&mut bctx, &state, Some(&funcaddr.to_string()), Some("0"))
        .expect("director installed");

    let mut body = BytesBody::new(br#"{"k":"v"}"#.to_vec()).with_segment_size(4);
    let mut result = director.fetch(&mut bctx, &mut state, Some(&mut body));

    assert_eq!(result.status, 200);
    assert_eq!(result.ctype, "application/json");
    assert_eq!(result.content_length, 9);
    assert_eq!(result.read_all(), br#"{"k":"v"}"#);

    let beresp = bctx.msg(HttpWhere::Beresp).unwrap();
    assert_eq!(beresp.status(), 200);
    assert_ne!(beresp.find("Content-Type"), HDR_INVALID);
    assert_ne!(beresp.find("Content-Length"), HDR_INVALID);
    assert_ne!(beresp.find("Last-Modified"), HDR_INVALID);
}

#[test]
fn recorded_backend_decision_supplies_the_generator() {
    let bed = TestBed::new();
    let mut hp = HookProgram::new();
    let gen = hp.prog.define_anon(|gc| {
        // funcarg travels through from backend_decision.
        if gc.arg(0) != 7 {
            sys_forge(gc, 500, "text/plain", b"bad funcarg")?;
        }
        sys_forge(gc, 201, "text/plain", b"forged")?;
        Ok(-1)
    });
    let prog = hp
        .hook(Hook::Recv, move |gc| {
            gc.syscall(Syscall::BackendDecision as u32, &[0, gen, 7])?;
            Ok(0)
        })
        .build();
    bed.install("be.example.com", "forge-be", prog);

    let mut ctx = VclCtx::for_request("GET", "/gen");
    let mut state = bed.fork(&mut ctx, "be.example.com");
    vcl::vcall(&mut ctx, &mut state, Hook::Recv);

    let mut bctx = VclCtx::for_backend("GET", "/gen");
    let director = vcl::vm_backend(&mut bctx, &state, None, None).expect("recorded generator");
    let mut result = director.fetch(&mut bctx, &mut state, None);
    assert_eq!(result.status, 201);
    assert_eq!(result.read_all(), b"forged");
}

#[test]
fn generator_without_forge_yields_synthetic_500() {
    let bed = TestBed::new();
    let prog = HookProgram::new()
        .hook(Hook::Recv, |_| Ok(0))
        .func("lazy_backend", |_| Ok(0))
        .build();
    bed.install("be.example.com", "lazy-be", prog);

    let mut ctx = VclCtx::for_request("GET", "/");
    let state = bed.fork(&mut ctx, "be.example.com");
    let funcaddr = state
        .script
        .as_ref()
        .unwrap()
        .instance()
        .resolve_address("lazy_backend")
        .unwrap();

    let mut bctx = VclCtx::for_backend("GET", "/");
    let mut state = state;
    let director = vcl::vm_backend(&mut bctx, &state, Some(&funcaddr.to_string()), None).unwrap();
    let mut result = director.fetch(&mut bctx, &mut state, None);

    assert_eq!(result.status, 500);
    assert_eq!(result.content_length, 0);
    let mut buf = [0u8; 8];
    assert_eq!(result.pull(&mut buf), (0, PullStatus::End));
    assert!(bctx.log.contains("produced no response"));
}

#[test]
fn zero_length_body_omits_content_type() {
    let bed = TestBed::new();
    let prog = HookProgram::new()
        .hook(Hook::Recv, |_| Ok(0))
        .func("empty_backend", |gc| {
            sys_forge(gc, 204, "", b"")?;
            Ok(-1)
        })
        .build();
    bed.install("be.example.com", "empty-be", prog);

    let mut ctx = VclCtx::for_request("GET", "/");
    let state = bed.fork(&mut ctx, "be.example.com");
    let funcaddr = state
        .script
        .as_ref()
        .unwrap()
        .instance()
        .resolve_address("empty_backend")
        .unwrap();

    let mut bctx = VclCtx::for_backend("GET", "/");
    let mut state = state;
    let director = vcl::vm_backend(&mut bctx, &state, Some(&funcaddr.to_string()), None).unwrap();
    let result = director.fetch(&mut bctx, &mut state, None);

    assert_eq!(result.status, 204);
    assert_eq!(result.content_length, 0);
    let beresp = bctx.msg(HttpWhere::Beresp).unwrap();
    assert_eq!(beresp.status(), 204);
    assert_eq!(beresp.find("Content-Type"), HDR_INVALID);
    assert_ne!(beresp.find("Last-Modified"), HDR_INVALID);
}

#[test]
fn generator_fault_yields_synthetic_500() {
    let bed = TestBed::new();
    let prog = HookProgram::new()
        .hook(Hook::Recv, |_| Ok(0))
        .func("crash_backend", |gc| {
            gc.read(0xBAD_0000, 4)?;
            Ok(0)
        })
        .build();
    bed.install("be.example.com", "crash-be", prog);

    let mut ctx = VclCtx::for_request("GET", "/");
    let state = bed.fork(&mut ctx, "be.example.com");
    let funcaddr = state
        .script
        .as_ref()
        .unwrap()
        .instance()
        .resolve_address("crash_backend")
        .unwrap();

    let mut bctx = VclCtx::for_backend("GET", "/");
    let mut state = state;
    let director = vcl::vm_backend(&mut bctx, &state, Some(&funcaddr.to_string()), None).unwrap();
    let result = director.fetch(&mut bctx, &mut state, None);
    assert_eq!(result.status, 500);
    assert_eq!(result.content_length, 0);
    assert!(bctx.log.contains("backend VM exception"));
}
