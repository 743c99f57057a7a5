//! Fork isolation, template immutability, program-swap pinning and
//! budget enforcement.

mod guestlib;

use guestlib::*;
use tenvm_contracts::VclCtx;
use tenvm_machine::{ScriptedProgram, SHEAP_BASE};
use tenvm_runtime::{vcl, update_program, Hook, UpdateParams};

/// A guest keeping a counter in its own memory: on_recv increments the
/// cell at the heap base and returns the new value.
fn counting_guest() -> ScriptedProgram {
    HookProgram::new()
        .init(|gc| {
            // First allocation of the program lands at the heap base.
            let addr = gc.alloc_bytes(&0u64.to_le_bytes())?;
            if addr != SHEAP_BASE {
                return Ok(-1);
            }
            Ok(0)
        })
        .hook(Hook::Recv, |gc| {
            let bytes = gc.read(SHEAP_BASE, 8)?;
            let n = u64::from_le_bytes(bytes.try_into().unwrap()) + 1;
            gc.write(SHEAP_BASE, &n.to_le_bytes())?;
            Ok(n as i64)
        })
        .build()
}

#[test]
fn forks_do_not_observe_each_other() {
    let bed = TestBed::new();
    bed.install("iso.example.com", "counter", counting_guest());

    let mut ctx_a = VclCtx::for_request("GET", "/");
    let mut a = bed.fork(&mut ctx_a, "iso.example.com");
    assert_eq!(vcl::vcall(&mut ctx_a, &mut a, Hook::Recv), 1);
    assert_eq!(vcl::vcall(&mut ctx_a, &mut a, Hook::Recv), 2);

    // A concurrent fork starts from the template snapshot, not from A's
    // mutated memory.
    let mut ctx_b = VclCtx::for_request("GET", "/");
    let mut b = bed.fork(&mut ctx_b, "iso.example.com");
    assert_eq!(vcl::vcall(&mut ctx_b, &mut b, Hook::Recv), 1);

    // And A is unaffected by B.
    assert_eq!(vcl::vcall(&mut ctx_a, &mut a, Hook::Recv), 3);
}

#[test]
fn template_stays_immutable_across_many_forks() {
    let bed = TestBed::new();
    bed.install("iso.example.com", "counter", counting_guest());

    for _ in 0..5 {
        let mut ctx = VclCtx::for_request("GET", "/");
        let mut state = bed.fork(&mut ctx, "iso.example.com");
        assert_eq!(vcl::vcall(&mut ctx, &mut state, Hook::Recv), 1);
    }
}

fn marker_guest(marker: i64) -> ScriptedProgram {
    HookProgram::new()
        .hook(Hook::Recv, move |_gc| Ok(marker))
        .build()
}

#[test]
fn script_keeps_its_program_across_a_hot_swap() {
    let bed = TestBed::new();
    bed.install("swap.example.com", "marker-a", marker_guest(1));
    bed.register_program("marker-b", marker_guest(2));

    let mut ctx_old = VclCtx::for_request("GET", "/");
    let mut old = bed.fork(&mut ctx_old, "swap.example.com");

    let tenant = bed.sandbox.tenant("swap.example.com").unwrap();
    let result = update_program(
        bed.sandbox.loader(),
        &tenant,
        &mut ctx_old.log,
        &UpdateParams {
            data: b"marker-b",
            is_debug: false,
        },
    );
    assert_eq!(result, "Update successful\n");

    // The pre-swap script still runs the old program.
    assert_eq!(vcl::vcall(&mut ctx_old, &mut old, Hook::Recv), 1);

    // A post-swap fork runs the new one.
    let mut ctx_new = VclCtx::for_request("GET", "/");
    let mut new = bed.fork(&mut ctx_new, "swap.example.com");
    assert_eq!(vcl::vcall(&mut ctx_new, &mut new, Hook::Recv), 2);
}

#[test]
fn budget_exhaustion_aborts_only_that_tenant() {
    let bed = TestBed::new();
    let spinner = HookProgram::new()
        .hook(Hook::Recv, |gc| loop {
            gc.burn(10_000)?;
        })
        .build();
    bed.register_program("spinner", spinner);
    bed.add_tenant("spin.example.com", "spinner", r#""max_instructions": 100000"#);
    bed.install("ok.example.com", "marker-ok", marker_guest(7));

    let mut ctx = VclCtx::for_request("GET", "/");
    let mut state = bed.fork(&mut ctx, "spin.example.com");
    assert_eq!(vcl::vcall(&mut ctx, &mut state, Hook::Recv), -1);
    assert!(ctx.log.contains("VM timeout"));

    // An unrelated tenant is unaffected.
    let mut ctx2 = VclCtx::for_request("GET", "/");
    let mut state2 = bed.fork(&mut ctx2, "ok.example.com");
    assert_eq!(vcl::vcall(&mut ctx2, &mut state2, Hook::Recv), 7);

    // The timed-out script may still be called again; policy is the
    // proxy's to decide.
    let mut ctx3 = VclCtx::for_request("GET", "/");
    ctx3.phase = tenvm_contracts::VclPhase::Recv;
    assert_eq!(vcl::vcall(&mut ctx3, &mut state, Hook::Recv), -1);
}

#[test]
fn guest_fault_is_logged_with_details() {
    let bed = TestBed::new();
    let prog = HookProgram::new()
        .hook(Hook::Recv, |gc| {
            // Touch unmapped memory.
            gc.read(0xDEAD_0000, 16)?;
            Ok(0)
        })
        .build();
    bed.install("fault.example.com", "faulter", prog);

    let mut ctx = VclCtx::for_request("GET", "/");
    let mut state = bed.fork(&mut ctx, "fault.example.com");
    assert_eq!(vcl::vcall(&mut ctx, &mut state, Hook::Recv), -1);
    assert!(ctx.log.contains("VM exception"));
}
