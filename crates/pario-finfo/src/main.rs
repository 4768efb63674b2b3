mod cli;
mod scan;

use clap::Parser;
use serde::Serialize;

use cli::CliArgs;
use pario_core::{ErrorHandler, LocalComm, Rearranger};
use scan::{FileReport, scan_dir, scan_file};

#[derive(Serialize)]
struct ScanReport {
    version: String,
    configured_backends: Vec<&'static str>,
    files: Vec<FileReport>,
}

fn run(args: &CliArgs, iosysid: i32) -> Result<Vec<FileReport>, String> {
    match (&args.ifile, &args.idir) {
        (Some(f), None) => scan_file(iosysid, f)
            .map(|r| vec![r])
            .map_err(|e| e.to_string()),
        (None, Some(d)) => scan_dir(iosysid, d).map_err(|e| e.to_string()),
        _ => Err("exactly one of --ifile or --idir is required".to_string()),
    }
}

fn main() {
    let args = CliArgs::parse();
    pario_backend_classic::register();
    pario_backend_log::register();

    // The io-task selection flags shape the probe iosystem, the same way
    // the library's own openers run.
    let comm = LocalComm::world(1).into_iter().next().unwrap();
    let iosysid = match pario_core::init_intracomm(
        comm,
        args.num_iotasks,
        args.iostride,
        args.ioroot,
        Rearranger::Box,
    ) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("pario-finfo: invalid io-task selection: {e}");
            std::process::exit(1);
        }
    };
    // Probe opens are expected to fail for mismatched backends.
    let _ = pario_core::set_error_handler(iosysid, ErrorHandler::Return);

    let reports = run(&args, iosysid);
    let _ = pario_core::finalize(iosysid);
    let reports = match reports {
        Ok(r) => r,
        Err(e) => {
            eprintln!("pario-finfo: {e}");
            std::process::exit(1);
        }
    };

    if args.json {
        let report = ScanReport {
            version: pario_core::version().to_string(),
            configured_backends: scan::configured_backend_names(),
            files: reports,
        };
        println!("{}", serde_json::to_string_pretty(&report).unwrap());
        return;
    }

    println!(
        "pario-finfo {} (backends: {})",
        pario_core::version(),
        scan::configured_backend_names().join(", ")
    );
    for r in &reports {
        println!("{}: {}", r.path, r.format.label());
        if args.verbose {
            if r.opens_with.is_empty() {
                println!("  opens with: (none)");
            } else {
                println!("  opens with: {}", r.opens_with.join(", "));
            }
        }
    }
}
