use std::error::Error;

use structopt::StructOpt;
use uvslice::format::seconds;
use uvslice::{Exposure, Kind, Options};

/// Extracts and prints print settings from supported MSLA slice file types.
#[derive(StructOpt, Debug)]
#[structopt(name = "uvslice-inspect", max_term_width = 80)]
struct Args {
    /// Print the height and exposure of every layer.
    #[structopt(long)]
    layers: bool,
    /// Decompress every layer, stopping at the first one that fails.
    #[structopt(long)]
    check: bool,
    /// File to read.
    #[structopt(parse(from_os_str))]
    input: std::path::PathBuf,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = Args::from_args();

    let input_image = std::fs::read(&args.input)?;
    let kind = Kind::from_path(&args.input)
        .or_else(|| Kind::detect(&input_image))
        .unwrap_or_else(|| {
            eprintln!("{}: unrecognized format", args.input.display());
            std::process::exit(1);
        });
    let format = kind.formatter(&Options::default())?;
    let print = format.decode(input_image)?;
    let props = print.properties();

    println!("--- {} ---", format.name());
    let size = &props.size;
    println!(
        "resolution: {} x {} px, bed {:.2} x {:.2} mm",
        size.resolution[0], size.resolution[1], size.bed_mm[0], size.bed_mm[1]
    );
    println!(
        "layers: {} at {:.3} mm",
        print.layer_count(),
        size.layer_height_mm
    );
    println!("estimated time: {:?}", props.duration());
    println!("--- exposure ---");
    print_exposure(&props.exposure);
    println!(
        "--- bottom exposure ({} layers, {:?}) ---",
        props.bottom.count, props.bottom.style
    );
    print_exposure(&props.bottom.exposure);
    println!("--- previews ---");
    for (kind, image) in &props.previews {
        println!("{:?}: {} x {}", kind, image.width(), image.height());
    }
    println!("--- metadata ---");
    for (key, value) in &props.metadata {
        println!("{}: {}", key, value);
    }

    if args.layers || args.check {
        if args.layers {
            println!("--- layers ---");
        }
        for i in 0..print.layer_count() {
            let layer = match print.layer(i) {
                Ok(layer) => layer,
                Err(e) if args.check => {
                    eprintln!("layer {} failed to decode: {}", i, e);
                    std::process::exit(2);
                }
                Err(e) => return Err(e.into()),
            };
            if args.layers {
                println!(
                    "{}: z {:.3} mm, on {:.2} s, off {:.2} s, pwm {}, lift {} mm",
                    i,
                    layer.z_mm,
                    seconds(layer.exposure.light_on),
                    seconds(layer.exposure.light_off),
                    layer.exposure.light_pwm,
                    layer.exposure.lift_height_mm
                );
            }
        }
        if args.check {
            println!("all {} layers decoded", print.layer_count());
        }
    }

    Ok(())
}

fn print_exposure(e: &Exposure) {
    println!("light on: {:.2} s", seconds(e.light_on));
    println!("light off: {:.2} s", seconds(e.light_off));
    println!("light pwm: {}", e.light_pwm);
    println!(
        "lift: {} mm at {} mm/min",
        e.lift_height_mm, e.lift_speed_mmpm
    );
    println!(
        "retract: {} mm at {} mm/min",
        e.retract_height_mm, e.retract_speed_mmpm
    );
}
