//! `kilosim techs` — print the supported DDR technology presets.

use anyhow::Result;

use kilosim_core::ddr::DdrTiming;

pub fn run() -> Result<()> {
    println!(
        "{:<16} {:>6} {:>4} {:>4} {:>4} {:>4} {:>4} {:>5} {:>5}",
        "tech", "tCK", "tCL", "tRCD", "tRP", "tRAS", "tFAW", "tRFC", "tREFI"
    );
    for tech in DdrTiming::preset_names() {
        let t = DdrTiming::preset(tech, 64).expect("listed preset must parse");
        println!(
            "{:<16} {:>6} {:>4} {:>4} {:>4} {:>4} {:>4} {:>5} {:>5}",
            tech, t.t_ck_ns, t.t_cl, t.t_rcd, t.t_rp, t.t_ras, t.t_faw, t.t_rfc, t.t_refi
        );
    }
    Ok(())
}
