// Global Descriptor Table (GDT) and Task State Segment (TSS)
//
// Long mode barely uses segmentation, but the GDT still defines the ring 0
// and ring 3 selectors the trap path loads, and the TSS tells the CPU which
// stack to switch to when a trap arrives from user mode.
//
// Key responsibilities:
// - Build kernel and user code/data descriptors in the fixed selector order
//   the rest of the kernel assumes (0x08, 0x10, 0x18|3, 0x20|3, TSS 0x28)
// - Point TSS.rsp0 at the kernel trap stack and IST[0] at a private
//   double-fault stack
// - Load the GDT, reload CS/DS/ES/SS and load the task register
//
// Design and implementation details:
// - Descriptor encoding and `lgdt`/`ltr` come from the `x86_64` crate
// - Both tables are built once inside `spin::Once`, which hands out the
//   `'static` references `lgdt` and `ltr` need
// - Selectors returned by the table are checked against the constants in
//   `arch`, so a reordering shows up at boot instead of as a #GP in iretq
//
// Correctness notes:
// - `init` must run before the IDT is loaded and before any environment is
//   entered; a ring 3 trap with no rsp0 triple-faults

use spin::Once;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use super::{KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, USER_CODE_SELECTOR, USER_DATA_SELECTOR};
use crate::{log_error, log_info};

pub const TSS_SELECTOR: u16 = 0x28;
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const LOG_ORIGIN: &str = "gdt";
const DOUBLE_FAULT_STACK_SIZE: usize = 4096 * 2;

#[repr(align(16))]
struct AlignedStack([u8; DOUBLE_FAULT_STACK_SIZE]);

static mut DOUBLE_FAULT_STACK: AlignedStack = AlignedStack([0; DOUBLE_FAULT_STACK_SIZE]);

static TSS: Once<TaskStateSegment> = Once::new();
static GDT: Once<(GlobalDescriptorTable, Selectors)> = Once::new();

struct Selectors {
    kernel_code: SegmentSelector,
    kernel_data: SegmentSelector,
    user_code: SegmentSelector,
    user_data: SegmentSelector,
    tss: SegmentSelector,
}

fn double_fault_stack_top() -> VirtAddr {
    let base = core::ptr::addr_of!(DOUBLE_FAULT_STACK) as u64;
    VirtAddr::new(base + DOUBLE_FAULT_STACK_SIZE as u64)
}

/// Install the GDT and TSS. `kernel_stack_top` becomes rsp0, the stack every
/// trap from ring 3 starts on.
pub fn init(kernel_stack_top: u64) {
    let tss = TSS.call_once(|| {
        let mut tss = TaskStateSegment::new();
        tss.privilege_stack_table[0] = VirtAddr::new(kernel_stack_top & !0xF);
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = double_fault_stack_top();
        tss
    });

    let (gdt, selectors) = GDT.call_once(|| {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        let user_code = gdt.append(Descriptor::user_code_segment());
        let user_data = gdt.append(Descriptor::user_data_segment());
        let tss = gdt.append(Descriptor::tss_segment(tss));
        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                user_code,
                user_data,
                tss,
            },
        )
    });

    let layout = [
        (selectors.kernel_code.0, KERNEL_CODE_SELECTOR),
        (selectors.kernel_data.0, KERNEL_DATA_SELECTOR),
        (selectors.user_code.0, USER_CODE_SELECTOR),
        (selectors.user_data.0, USER_DATA_SELECTOR),
        (selectors.tss.0, TSS_SELECTOR),
    ];
    for (actual, expected) in layout {
        if actual != expected {
            log_error!(
                LOG_ORIGIN,
                "selector mismatch: table gave {:#x}, kernel expects {:#x}",
                actual,
                expected
            );
        }
    }

    gdt.load();
    // SAFETY: the selectors index the table just loaded, and the TSS
    // descriptor points at a 'static TSS.
    unsafe {
        CS::set_reg(selectors.kernel_code);
        DS::set_reg(selectors.kernel_data);
        ES::set_reg(selectors.kernel_data);
        SS::set_reg(selectors.kernel_data);
        load_tss(selectors.tss);
    }

    log_info!(
        LOG_ORIGIN,
        "GDT/TSS loaded: rsp0={:#x} df_ist={:#x}",
        kernel_stack_top & !0xF,
        double_fault_stack_top().as_u64()
    );
}
