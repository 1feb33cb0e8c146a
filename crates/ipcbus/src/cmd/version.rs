use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("ipcbus {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: ipcbus");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "build_target: {}",
        option_env!("IPCBUS_BUILD_TARGET").unwrap_or("unknown")
    );
    println!(
        "protocol_version: {}",
        ipcbus_wire::PROTOCOL_VERSION
    );
    println!("features: cli=true");

    Ok(SUCCESS)
}
