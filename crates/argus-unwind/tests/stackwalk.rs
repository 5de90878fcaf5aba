// Once clippy takes `clippy.toml` into account (for `tests` targets),
// we can remove these.
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(missing_docs)]

mod common;

use std::collections::BTreeMap;

use argus_unwind::{CfaRule, CfiCache, EvalMode, ExprContext, SectionKind};

use self::common::{DW_CFA_DEF_CFA, DW_CFA_DEF_CFA_OFFSET, DW_CFA_DEF_CFA_REGISTER, SectionBuilder};

const RSP: u16 = 7;
const RBP: u16 = 6;
const RA: u16 = 16;

const MAIN_START: u64 = 0x40_1000;
const CALLEE_START: u64 = 0x40_2000;

/// Register file and stack memory of one stopped thread.
struct Machine {
    registers: BTreeMap<u16, u64>,
    memory: BTreeMap<u64, u64>,
}

impl ExprContext for Machine {
    fn register(&mut self, register: u16) -> Option<u64> {
        self.registers.get(&register).copied()
    }

    fn read_word(&mut self, addr: u64) -> Option<u64> {
        self.memory.get(&addr).copied()
    }
}

/// Two x86_64-flavored functions: `main` keeps the entry CFA, the callee
/// runs the usual push-rbp prologue before rebasing the CFA onto rbp.
fn two_function_section() -> CfiCache {
    let mut builder = SectionBuilder::new(SectionKind::EhFrame);

    // CFA = rsp + 8 at entry, return address saved at CFA - 8.
    let cie = builder.cie(&[DW_CFA_DEF_CFA, RSP as u8, 8, 0x80 | RA as u8, 1]);

    builder.fde(cie, MAIN_START, 0x100, &[]);
    builder.fde(
        cie,
        CALLEE_START,
        0x80,
        &[
            0x40 | 1, // push rbp
            DW_CFA_DEF_CFA_OFFSET,
            16,
            0x80 | RBP as u8,
            2, // rbp at CFA - 16
            0x40 | 3, // mov rbp, rsp
            DW_CFA_DEF_CFA_REGISTER,
            RBP as u8,
        ],
    );

    CfiCache::new(SectionKind::EhFrame, builder.finish(), 0x1000, 8, true)
}

/// Steps one frame: resolves the CFA, recovers the return address and the
/// callee-saved frame register, then rewrites the register file the way
/// the caller saw it.
fn step(cache: &mut CfiCache, machine: &mut Machine, pc: u64) -> Option<u64> {
    let state = cache
        .frame_state(pc, EvalMode::Strict)
        .expect("frame state")?;

    let cfa = cache.cfa_value(&state, machine).expect("cfa");

    let ra = cache
        .register_value(&state, state.return_address_register, cfa, machine)
        .expect("return address")?;

    let rbp = cache
        .register_value(&state, RBP, cfa, machine)
        .expect("frame register");

    machine.registers.insert(RSP, cfa);
    if let Some(rbp) = rbp {
        machine.registers.insert(RBP, rbp);
    }

    Some(ra)
}

#[test_log::test]
fn walks_a_two_frame_stack() {
    let mut cache = two_function_section();

    // Stopped deep in the callee, prologue complete: CFA = rbp + 16, the
    // return address into `main` one word below, the saved rbp below that.
    let mut machine = Machine {
        registers: [(RSP, 0x7fff_ef90), (RBP, 0x7fff_f000)].into_iter().collect(),
        memory: [
            (0x7fff_f008, MAIN_START + 0x42),
            (0x7fff_f000, 0x7fff_f100),
            // main's own return address leads outside any FDE.
            (0x7fff_f010, 0xdead_0000),
        ]
        .into_iter()
        .collect(),
    };

    let mut pcs = vec![CALLEE_START + 0x10];

    loop {
        let Some(ra) = step(&mut cache, &mut machine, *pcs.last().expect("pc")) else {
            break;
        };

        // A return address no FDE covers ends the walk.
        if cache.find_fde(ra).expect("lookup").is_none() {
            break;
        }

        pcs.push(ra);
    }

    assert_eq!(pcs, [CALLEE_START + 0x10, MAIN_START + 0x42]);

    // The unwound register file reflects main's frame.
    assert_eq!(machine.registers.get(&RSP), Some(&0x7fff_f018));
    assert_eq!(machine.registers.get(&RBP), Some(&0x7fff_f100));
}

#[test_log::test]
fn prologue_rows_differ_by_address() {
    let mut cache = two_function_section();

    let entry = cache
        .frame_state(CALLEE_START, EvalMode::Strict)
        .expect("eval")
        .expect("covered");
    let done = cache
        .frame_state(CALLEE_START + 0x10, EvalMode::Strict)
        .expect("eval")
        .expect("covered");

    assert_eq!(
        entry.cfa,
        CfaRule::RegisterOffset {
            register: RSP,
            offset: 8
        }
    );
    assert_eq!(
        done.cfa,
        CfaRule::RegisterOffset {
            register: RBP,
            offset: 16
        }
    );
}

#[test_log::test]
fn repeated_walks_yield_identical_frames() {
    let mut cache = two_function_section();

    let (first, _) = cache
        .find_fde(CALLEE_START + 0x10)
        .expect("lookup")
        .expect("covered");

    // Disturb the cache with unrelated queries.
    assert!(cache.find_fde(0xffff_ffff).expect("lookup").is_none());
    cache.find_fde(MAIN_START).expect("lookup").expect("covered");

    let (second, _) = cache
        .find_fde(CALLEE_START + 0x10)
        .expect("lookup")
        .expect("covered");

    assert_eq!(first.offset, second.offset);
    assert_eq!(first, second);
}
