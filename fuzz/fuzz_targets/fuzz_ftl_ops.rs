#![no_main]
use flight_storage::ftl::Ftl;
use flight_storage::{Geometry, SimNand};
use libfuzzer_sys::{
    arbitrary::{Arbitrary, Unstructured},
    fuzz_target,
};
use std::collections::{HashMap, HashSet};

const SPAN: u32 = 64;

#[derive(Debug, Arbitrary)]
enum Op {
    Write { logical: u8, fill: u8 },
    Trim { start: u8, len: u8 },
    Sync,
    Remount,
    PowerCut { after: u8 },
    FailProgram { block: u8 },
}

// Random operation streams, checked against a map after every remount.
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);
    let ops: Vec<Op> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let nand = SimNand::new(Geometry::small(16));
    let mut ftl = match Ftl::mount(nand.clone()) {
        Ok(ftl) => ftl,
        Err(_) => return,
    };
    let mut model: HashMap<u32, u8> = HashMap::new();
    // Logical pages whose contents are uncertain after a failed operation.
    let mut unsure: HashSet<u32> = HashSet::new();

    for op in ops.into_iter().take(300) {
        match op {
            Op::Write { logical, fill } => {
                let logical = logical as u32 % SPAN;
                match ftl.write(logical, &[fill; 512]) {
                    Ok(()) => {
                        model.insert(logical, fill);
                        unsure.remove(&logical);
                    }
                    Err(_) => {
                        unsure.insert(logical);
                    }
                }
            }
            Op::Trim { start, len } => {
                let start = start as u32 % SPAN;
                let end = (start + len as u32 % 8).min(SPAN);
                if ftl.trim(start..end).is_ok() {
                    for logical in start..end {
                        model.remove(&logical);
                        unsure.remove(&logical);
                    }
                } else {
                    for logical in start..end {
                        unsure.insert(logical);
                    }
                }
            }
            Op::Sync => {
                let _ = ftl.sync();
            }
            Op::Remount | Op::PowerCut { .. } => {
                if let Op::PowerCut { after } = op {
                    nand.cut_power_after(after as u64);
                    for logical in 0..4 {
                        if ftl.write(logical, &[0xEE; 512]).is_ok() {
                            model.insert(logical, 0xEE);
                            unsure.remove(&logical);
                        } else {
                            unsure.insert(logical);
                            break;
                        }
                    }
                }
                drop(ftl);
                nand.restore_power();
                nand.clear_faults();
                ftl = match Ftl::mount(nand.clone()) {
                    Ok(ftl) => ftl,
                    Err(_) => return,
                };
            }
            Op::FailProgram { block } => {
                nand.fail_program(block as u32 % 16);
            }
        }
    }

    nand.clear_faults();
    let mut buf = [0u8; 512];
    for logical in 0..SPAN {
        if unsure.contains(&logical) {
            continue;
        }
        if ftl.read(logical, &mut buf).is_err() {
            continue;
        }
        match model.get(&logical) {
            Some(&fill) => assert!(buf.iter().all(|&b| b == fill), "logical {}", logical),
            None => assert!(buf.iter().all(|&b| b == 0xFF), "logical {}", logical),
        }
    }
});
