//! Hook dispatch and the decision protocol.

mod guestlib;

use guestlib::*;
use tenvm_contracts::{VclCtx, VclPhase};
use tenvm_runtime::{vcl, Decision, Hook, VclAction};

/// A guest whose on_recv takes whatever decision the X-Decide request
/// header names.
fn decide_from_header() -> tenvm_machine::ScriptedProgram {
    HookProgram::new()
        .hook(Hook::Recv, |gc| {
            let whence = gc.arg(0);
            let h = sys_find(gc, whence, "X-Decide")?;
            if h < 0 {
                return Ok(-1);
            }
            let line = sys_retrieve(gc, whence, h as u64)?.unwrap_or_default();
            let token = line.split(": ").nth(1).unwrap_or("").to_string();
            sys_decision(gc, &token, 200, false)?;
            Ok(0)
        })
        .build()
}

#[test]
fn every_decision_token_round_trips() {
    let bed = TestBed::new();
    bed.install("ten.example.com", "decider", decide_from_header());

    for token in [
        "hash", "pass", "lookup", "synth", "fetch", "deliver", "retry", "restart", "abandon",
        "fail",
    ] {
        let mut ctx = VclCtx::for_request("GET", "/");
        ctx.msg_mut(tenvm_contracts::HttpWhere::Req)
            .unwrap()
            .append(&format!("X-Decide: {token}"))
            .unwrap();
        let mut state = bed.fork(&mut ctx, "ten.example.com");
        vcl::vcall(&mut ctx, &mut state, Hook::Recv);
        assert_eq!(vcl::want_result(&state), token, "token {token}");
    }
}

#[test]
fn fork_resets_decision_state() {
    let bed = TestBed::new();
    bed.install("ten.example.com", "decider", decide_from_header());

    let mut ctx = VclCtx::for_request("GET", "/");
    ctx.msg_mut(tenvm_contracts::HttpWhere::Req)
        .unwrap()
        .append("X-Decide: pass")
        .unwrap();
    let mut state = bed.fork(&mut ctx, "ten.example.com");
    vcl::vcall(&mut ctx, &mut state, Hook::Recv);
    assert_eq!(vcl::want_result(&state), "pass");

    // A fresh fork starts with ("", [0,0,0], false).
    let mut ctx2 = VclCtx::for_request("GET", "/");
    let state2 = bed.fork(&mut ctx2, "ten.example.com");
    assert_eq!(vcl::want_result(&state2), "");
    assert_eq!(vcl::result_value(&state2, 0), 0);
    assert!(!vcl::want_resume(&state2));
}

#[test]
fn unregistered_hook_is_a_noop() {
    let bed = TestBed::new();
    bed.install("ten.example.com", "decider", decide_from_header());

    let mut ctx = deliver_ctx("GET", "/");
    let mut state = bed.fork(&mut ctx, "ten.example.com");
    assert_eq!(vcl::vcall(&mut ctx, &mut state, Hook::Deliver), -1);
    assert!(ctx.log.contains("on_deliver"));
    // No decision was taken.
    assert_eq!(vcl::want_result(&state), "");
    assert_eq!(vcl::decision_action(&state), VclAction::Default);
}

#[test]
fn first_decision_wins_within_a_hook() {
    let bed = TestBed::new();
    let prog = HookProgram::new()
        .hook(Hook::Recv, |gc| {
            sys_decision(gc, "synth", 403, false)?;
            sys_decision(gc, "pass", 0, false)?;
            Ok(0)
        })
        .build();
    bed.install("ten.example.com", "first-wins", prog);

    let mut ctx = VclCtx::for_request("GET", "/");
    let mut state = bed.fork(&mut ctx, "ten.example.com");
    vcl::vcall(&mut ctx, &mut state, Hook::Recv);
    assert_eq!(vcl::want_result(&state), "synth");
    assert_eq!(vcl::want_status(&state), 403);
}

#[test]
fn pause_and_resume_runs_the_second_half() {
    let bed = TestBed::new();
    let prog = HookProgram::new()
        .hook(Hook::Recv, |gc| {
            gc.on_resume(|gc| {
                let whence = tenvm_contracts::HttpWhere::Req as u64;
                sys_append(gc, whence, "X-After-Resume: yes")?;
                Ok(7)
            });
            sys_decision(gc, "fetch", 0, true)?;
            // Unreachable: pause_for halts the machine.
            Ok(-1)
        })
        .build();
    bed.install("ten.example.com", "pauser", prog);

    let mut ctx = VclCtx::for_request("GET", "/");
    let mut state = bed.fork(&mut ctx, "ten.example.com");
    vcl::vcall(&mut ctx, &mut state, Hook::Recv);
    assert_eq!(vcl::want_result(&state), "fetch");
    assert!(vcl::want_resume(&state));

    let ret = vcl::resume(&mut ctx, &mut state);
    assert_eq!(ret, 7);
    let req = ctx.msg(tenvm_contracts::HttpWhere::Req).unwrap();
    assert_ne!(req.find("X-After-Resume"), tenvm_contracts::HDR_INVALID);
}

#[test]
fn pause_for_is_single_use_per_hook() {
    let bed = TestBed::new();
    let prog = HookProgram::new()
        .hook(Hook::Recv, |gc| {
            gc.on_resume(|gc| {
                // A second pause in the same hook is rejected.
                let r = sys_decision(gc, "deliver", 0, true)?;
                Ok(r)
            });
            sys_decision(gc, "fetch", 0, true)?;
            Ok(0)
        })
        .build();
    bed.install("ten.example.com", "repauser", prog);

    let mut ctx = VclCtx::for_request("GET", "/");
    let mut state = bed.fork(&mut ctx, "ten.example.com");
    vcl::vcall(&mut ctx, &mut state, Hook::Recv);
    assert!(vcl::want_resume(&state));
    let ret = vcl::resume(&mut ctx, &mut state);
    assert_eq!(ret, -1);
    assert!(ctx.log.contains("pause_for"));
}

#[test]
fn defaults_without_a_script() {
    let state = tenvm_runtime::RequestState::new();
    assert!(!vcl::active(&state));
    assert_eq!(vcl::want_result(&state), "");
    assert_eq!(vcl::result_value(&state, 0), 503);
    assert_eq!(vcl::want_status(&state), 503);
    assert_eq!(vcl::current_name(&state), None);
}

#[test]
fn run_maps_the_phase_to_the_hook() {
    let bed = TestBed::new();
    let prog = HookProgram::new()
        .hook(Hook::Recv, |gc| {
            sys_decision(gc, "lookup", 0, false)?;
            Ok(0)
        })
        .hook(Hook::Deliver, |gc| {
            let whence = gc.arg(1);
            sys_append(gc, whence, "X-Delivered: 1")?;
            Ok(0)
        })
        .build();
    bed.install("ten.example.com", "phased", prog);

    let mut ctx = VclCtx::for_request("GET", "/");
    let mut state = bed.fork(&mut ctx, "ten.example.com");
    assert_eq!(ctx.phase, VclPhase::Recv);
    vcl::run(&mut ctx, &mut state, None);
    assert_eq!(vcl::want_result(&state), Decision::Lookup.as_str());

    ctx.phase = VclPhase::Deliver;
    vcl::run(&mut ctx, &mut state, None);
    let resp = ctx.msg(tenvm_contracts::HttpWhere::Resp).unwrap();
    assert_ne!(resp.find("X-Delivered"), tenvm_contracts::HDR_INVALID);
}
