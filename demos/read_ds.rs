/// Print a summary of a CTF dataset directory
///
/// Usage: cargo run --example read_ds -- path/to/subject.ds
use ctf::{
    fit_rigid, head_motion, read_hc_file, Coil, FidFrame, Frame, Landmarks, Meg4, OpenMode, Res4,
    SensorType,
};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

fn ds_file(ds: &Path, ext: &str) -> PathBuf {
    let setname = ds
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    ds.join(format!("{}.{}", setname, ext))
}

fn main() -> ctf::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <dataset.ds>", args[0]);
        std::process::exit(1);
    }

    let ds = Path::new(&args[1]);
    println!("Opening CTF dataset: {}", ds.display());
    println!("{}", "=".repeat(60));

    let res4 = Res4::read(&ds_file(ds, "res4"))?;

    println!("Basic Information:");
    println!("  Run: {}", res4.run_description());
    println!("  Recorded: {} {}", res4.date(), res4.time());
    println!("  Number of channels: {}", res4.num_channels());
    println!(
        "  Trials: {} x {} samples",
        res4.num_trials(),
        res4.num_samples()
    );
    println!("  Sampling frequency: {:.2} Hz", res4.sample_rate());
    println!("  Pre-trigger: {:.4} s", res4.pre_trig_seconds());
    if res4.is_average() {
        println!("  Averaged dataset");
    }
    println!();

    // Count channels by type
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for ch in &res4.channels {
        *counts.entry(ch.sensor_type.name()).or_default() += 1;
    }
    println!("Channel Types:");
    for (name, count) in &counts {
        println!("  {}: {}", name, count);
    }
    println!();

    println!("First 10 Channels:");
    for (i, ch) in res4.channels.iter().take(10).enumerate() {
        println!(
            "  {}: {} ({}) - gain={:.3e}",
            i,
            ch.name,
            ch.sensor_type.name(),
            ch.gain
        );
    }
    if res4.channels.len() > 10 {
        println!("  ... and {} more channels", res4.channels.len() - 10);
    }
    println!();

    if let Some(balancing) = &res4.balancing {
        println!("Balancing: {} coefficient records", balancing.len());
        println!();
    }

    // The sample file may be absent
    match Meg4::open(&res4, &ds_file(ds, "meg4")) {
        Ok(meg4) => {
            let n = meg4.num_samples().min(600);
            let block = meg4.primary_block(0, 0, n)?;
            println!("Primary block, trial 0: {} x {}", block.nrows(), block.ncols());
            let peak = block.iter().fold(0.0f64, |m, v| m.max(v.abs()));
            println!("  Peak amplitude: {:.3e}", peak);
            println!(
                "  MEG sensors: {}",
                res4.sensor_list(SensorType::Meg).len()
            );
            meg4.close();
        }
        Err(e) => println!("No sample data: {}", e),
    }
    println!();

    let hc = ds_file(ds, "hc");
    if hc.exists() {
        let dewar = read_hc_file(&hc, Frame::Dewar)?;
        let frame = FidFrame::new(&dewar.nasion, &dewar.left, &dewar.right)?;
        let head = frame.transform_all(&dewar.points());

        println!("Head Coils (dewar -> head):");
        for (label, (d, h)) in ["nasion", "left", "right"]
            .iter()
            .zip(dewar.points().iter().zip(head.iter()))
        {
            println!(
                "  {:6}: ({:.3}, {:.3}, {:.3}) -> ({:.3}, {:.3}, {:.3})",
                label, d[0], d[1], d[2], h[0], h[1], h[2]
            );
        }
        println!("  left - right: {:.3} cm", (dewar.left - dewar.right).norm());

        // Continuous head localization, when recorded
        if res4.channel_index("HLC0011").is_some() {
            if let Ok(meg4) = Meg4::open_with(&res4, &ds_file(ds, "meg4"), OpenMode::ReadOnly) {
                let head = Landmarks {
                    nasion: head[0],
                    left: head[1],
                    right: head[2],
                };
                println!("  Maximum coil displacement per trial (cm):");
                for trial in 0..meg4.num_trials() {
                    let mut line = format!("    {:4}:", trial);
                    for coil in [Coil::Nasion, Coil::Left, Coil::Right] {
                        let motion = head_motion(&res4, &meg4, &frame, &head, trial, coil)?;
                        let peak = motion
                            .rows()
                            .into_iter()
                            .map(|r| r.dot(&r).sqrt())
                            .fold(0.0f64, f64::max);
                        line.push_str(&format!(" {} {:.3}", coil.name(), peak));
                    }
                    println!("{}", line);
                }
            }
        }

        // Compare with a second dataset when given
        if let Some(other) = args.get(2) {
            let other = read_hc_file(&ds_file(Path::new(other), "hc"), Frame::Dewar)?;
            let fit = fit_rigid(&dewar.points(), &other.points())?;
            println!(
                "  Movement: rotation {:.2} degrees, translation {:.2} cm",
                fit.angle, fit.distance
            );
        }
    }

    Ok(())
}
