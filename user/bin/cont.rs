#![no_std]
#![no_main]

use user::*;

fn usage() -> ! {
    exit_with_msg(
        "usage: cont create <path> | cont start <name> <prog> [args...] | \
         cont pause <name> | cont resume <name> | cont stop <name>",
    );
}

#[unsafe(no_mangle)]
fn main(args: Args) {
    let mut it = args.args_as_str();
    let Some(subcmd) = it.next() else { usage() };

    match subcmd {
        "create" => {
            let Some(path) = it.next() else { usage() };
            match ccreate(path) {
                Ok(cid) => println!("created container {} (cid {})", path, cid),
                Err(e) => exit_with_msg_fmt("cont create", e),
            }
        }
        "start" => {
            let Some(name) = it.next() else { usage() };
            let Some(prog) = it.next() else { usage() };

            require_cwd_in_root(name);

            let cid = match cstart(name) {
                Ok(cid) => cid,
                Err(e) => exit_with_msg_fmt("cont start", e),
            };

            const MAXARGS: usize = 16;
            let mut argv = [""; MAXARGS];
            argv[0] = prog;
            let mut argc = 1;
            for arg in it {
                if argc >= MAXARGS {
                    exit_with_msg("cont start: too many args");
                }
                argv[argc] = arg;
                argc += 1;
            }

            match cfork(cid) {
                Ok(0) => {
                    exec(prog, &argv[..argc]);
                    exit_with_msg("cont start: exec failed");
                }
                Ok(pid) => println!("started {} in container {} (pid {})", prog, name, pid),
                Err(e) => exit_with_msg_fmt("cont start", e),
            }
        }
        "pause" => {
            let Some(name) = it.next() else { usage() };
            if let Err(e) = cpause(name) {
                exit_with_msg_fmt("cont pause", e);
            }
        }
        "resume" => {
            let Some(name) = it.next() else { usage() };
            require_cwd_in_root(name);
            if let Err(e) = cresume(name) {
                exit_with_msg_fmt("cont resume", e);
            }
        }
        "stop" => {
            let Some(name) = it.next() else { usage() };
            if let Err(e) = cstop(name) {
                exit_with_msg_fmt("cont stop", e);
            }
        }
        "ps" => {
            let mut buf = [0u8; 512];
            match cps(&mut buf) {
                Ok(n) => {
                    let s = core::str::from_utf8(&buf[..n]).unwrap_or("<invalid utf8>");
                    print!("{}", s);
                }
                Err(e) => exit_with_msg_fmt("cont ps", e),
            }
        }
        _ => usage(),
    }
}

fn exit_with_msg_fmt(context: &str, e: SysError) -> ! {
    eprintln!("{}: {}", context, e);
    exit(1);
}

/// Enforces that the caller's cwd sits inside the named container's
/// rootpath, the policy gate `resume` (and this CLI's `start`) requires.
fn require_cwd_in_root(name: &str) {
    let mut root_buf = [0u8; ROOTPATHSZ];
    if let Err(e) = getcontrootdir(name, &mut root_buf) {
        exit_with_msg_fmt("cont", e);
    }
    let root_len = root_buf.iter().position(|&b| b == 0).unwrap_or(ROOTPATHSZ);
    let root = core::str::from_utf8(&root_buf[..root_len]).unwrap_or("/");

    let mut cwd_buf = [0u8; MAXPATH];
    let cwd_len = match pwd(&mut cwd_buf) {
        Ok(n) => n,
        Err(e) => exit_with_msg_fmt("cont: getting current directory", e),
    };
    let cwd = core::str::from_utf8(&cwd_buf[..cwd_len]).unwrap_or("/");

    if !is_prefix(cwd, root) {
        eprintln!("cont: has to be in its root directory");
        exit(1);
    }
}
