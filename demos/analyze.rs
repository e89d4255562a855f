use pyc_analyzer::{analyze_all, load_value, prelude::*};

/// Size of the pyc header: magic, flags, and either mtime and source size or the source hash
const PYC_HEADER_LEN: usize = 16;

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let (Some(path), Some(version)) = (args.next(), args.next()) else {
        eprintln!("usage: analyze <file.pyc> <python version, e.g. 3.12> [--sir]");
        std::process::exit(2);
    };
    let show_sir = args.next().as_deref() == Some("--sir");

    let version: PyVersion = version.parse().expect("Invalid Python version");
    let data = std::fs::read(&path).expect("Could not read pyc file");

    let payload = data
        .get(PYC_HEADER_LEN..)
        .expect("File is shorter than a pyc header");

    let tree = load_value(payload, version).expect("Invalid marshal data");
    let report = analyze_all(&tree, version).expect("Unsupported Python version");

    for analysis in &report.analyses {
        println!(
            "{:<40} line {:>5}  {:>4} blocks  {:>3} exits  max stack {:>3} (declared {})",
            analysis.code.qualname,
            analysis.code.firstlineno,
            analysis.cfg.blocks.len(),
            analysis.cfg.exits().len(),
            analysis.cfg.max_stack_depth(),
            analysis.code.stacksize,
        );

        let Some(sir) = analysis.sir.as_ref().filter(|_| show_sir) else {
            continue;
        };
        for (index, block) in sir.blocks.iter().enumerate() {
            let Some(block) = block else { continue };

            println!("  block {index}:");
            for line in block.to_string().lines() {
                println!("    {line}");
            }
        }
    }

    for failure in &report.failures {
        println!(
            "{:<40} line {:>5}  failed: {}",
            failure.qualname, failure.firstlineno, failure.error
        );
    }
}
