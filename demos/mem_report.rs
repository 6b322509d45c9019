use std::error::Error;

use dos_memory::{MemoryConfig, MemoryManager};

// Boot a machine, load a couple of "programs", and print what MEM would say.
// Run with RUST_LOG=debug to watch the chain change.
fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let mut mm = MemoryManager::new(MemoryConfig::default())?;
    println!("{}\n", mm.report());

    let shell = mm.allocate(0x0800, 0x0400)?;
    let tsr = mm.allocate_umb(0x0900, 0x0200)?;
    let handle = mm.xms_allocate(1024)?;
    println!(
        "Shell at {:#06x}, TSR at {:#06x}, XMS handle {}\n",
        shell, tsr, handle
    );

    println!("{:#}\n", mm.dos().snapshot(mm.ram()));
    println!("{}", mm.report());
    Ok(())
}
