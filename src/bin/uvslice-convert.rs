use std::error::Error;
use std::path::Path;

use clap::{arg_enum, AppSettings};
use structopt::StructOpt;
use uvslice::{Kind, Options};

arg_enum! {
    #[allow(non_camel_case_types)]
    #[derive(Copy, Clone, Debug, PartialEq)]
    enum Format {
        ctb,
        cbddlp,
        photon,
        phz,
        fdg,
        pws,
        pw0,
        lgs,
        lgs30,
    }
}

impl From<Format> for Kind {
    fn from(f: Format) -> Self {
        match f {
            Format::ctb => Kind::Ctb,
            Format::cbddlp => Kind::Cbddlp,
            Format::photon => Kind::Photon,
            Format::phz => Kind::Phz,
            Format::fdg => Kind::Fdg,
            Format::pws => Kind::Pws,
            Format::pw0 => Kind::Pw0,
            Format::lgs => Kind::Lgs,
            Format::lgs30 => Kind::Lgs30,
        }
    }
}

/// Performs format conversions between supported MSLA slice file types.
#[derive(StructOpt, Debug)]
#[structopt(name = "uvslice-convert", max_term_width = 80, no_version,
    global_settings = &[AppSettings::DisableVersion])]
struct Args {
    /// Output encryption seed, or 0 to disable output encryption.
    ///
    /// Must be a 32-bit integer. If this option isn't present, ctb and fdg
    /// output is scrambled with a random seed, and phz output is left plain.
    /// Ignored if the output format does not support encryption.
    #[structopt(long)]
    encryption_seed: Option<u32>,
    /// Antialiasing level for the output: 1, 2, 4 or 8, as the output
    /// format allows.
    #[structopt(long)]
    anti_alias: Option<u32>,
    /// Output format version, for formats that have more than one.
    #[structopt(long = "version")]
    format_version: Option<u32>,
    /// Input file format.
    ///
    /// If omitted, the format is guessed from the file extension, and failing
    /// that from the file's contents.
    #[structopt(short = "I", long, possible_values = &Format::variants(),
        case_insensitive = true)]
    input_format: Option<Format>,
    /// Output file format.
    ///
    /// If omitted, the format is guessed from the file extension. The format
    /// must be provided explicitly if the output file does not have an
    /// extension, or if the extension is non-standard.
    #[structopt(short = "O", long, possible_values = &Format::variants(),
        case_insensitive = true)]
    output_format: Option<Format>,
    /// File to read.
    #[structopt(parse(from_os_str))]
    input: std::path::PathBuf,
    /// File to write.
    #[structopt(parse(from_os_str))]
    output: std::path::PathBuf,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();
    let args = Args::from_args();

    let output_kind = args
        .output_format
        .map(Kind::from)
        .or_else(|| Kind::from_path(&args.output))
        .unwrap_or_else(|| {
            eprintln!(
                "output file must have a recognized extension, or \
            format must be specified"
            );
            std::process::exit(1);
        });

    // Reject impossible settings before doing any work.
    let options = Options {
        anti_alias: args.anti_alias,
        version: args.format_version,
        encryption_seed: args.encryption_seed,
    };
    let writer = output_kind.formatter(&options)?;

    let input_image = std::fs::read(&args.input)?;
    let input_kind = args
        .input_format
        .map(Kind::from)
        .or_else(|| Kind::from_path(&args.input))
        .or_else(|| Kind::detect(&input_image))
        .unwrap_or_else(|| {
            eprintln!(
                "can't tell what format {} is in; use -I to specify it",
                args.input.display()
            );
            std::process::exit(1);
        });
    let reader = input_kind.formatter(&Options::default())?;

    log::info!(
        "converting {} ({}) to {} ({})",
        args.input.display(),
        reader.name(),
        args.output.display(),
        writer.name()
    );
    let print = reader.decode(input_image)?;

    // Write to a temporary sibling so a failed encode doesn't leave a
    // truncated file behind.
    let partial = partial_path(&args.output);
    let mut out = std::io::BufWriter::new(std::fs::File::create(&partial)?);
    let result = writer
        .encode(print.as_ref(), &mut out)
        .map_err(Box::<dyn Error>::from)
        .and_then(|()| {
            use std::io::Write;
            out.flush()?;
            Ok(())
        });
    drop(out);
    match result {
        Ok(()) => std::fs::rename(&partial, &args.output)?,
        Err(e) => {
            std::fs::remove_file(&partial).ok();
            return Err(e);
        }
    }

    Ok(())
}

fn partial_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}
