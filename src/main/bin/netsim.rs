use std::ffi::OsString;

fn main() {
    let args: Vec<OsString> = std::env::args_os().collect();
    let args = args.iter().map(|x| x.as_os_str()).collect();

    if let Err(e) = netsim::core::main::run_netsim(args) {
        log::error!("{:?}", e);
        eprintln!("** netsim did not complete successfully");
        eprintln!("**   {}", e);
        for cause in e.chain().skip(1) {
            eprintln!("**   caused by: {}", cause);
        }
        std::process::exit(1);
    }
}
