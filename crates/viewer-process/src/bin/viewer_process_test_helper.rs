use std::{
    env,
    io::{self, Read, Write},
    process, thread,
    time::Duration,
};

fn required(value: Option<String>, flag: &str) -> String {
    value.unwrap_or_else(|| {
        eprintln!("missing value for {flag}");
        process::exit(2);
    })
}

fn parse_u64(value: Option<String>, flag: &str) -> u64 {
    let value = required(value, flag);
    value.parse().unwrap_or_else(|_| {
        eprintln!("invalid u64 for {flag}: {value}");
        process::exit(2);
    })
}

fn spawn_child_sleep(ms: u64) {
    let exe = env::current_exe().unwrap_or_else(|err| {
        eprintln!("failed to resolve current exe: {err}");
        process::exit(2);
    });

    let _child = process::Command::new(exe)
        .args(["--sleep-ms", &ms.to_string()])
        .stdin(process::Stdio::null())
        .spawn()
        .unwrap_or_else(|err| {
            eprintln!("failed to spawn child: {err}");
            process::exit(2);
        });
}

fn main() {
    let mut exit_code = 0;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--echo-stdin" => {
                let mut input = Vec::new();
                io::stdin().read_to_end(&mut input).unwrap();
                io::stdout().write_all(&input).unwrap();
                io::stdout().flush().unwrap();
            }
            "--stdout" => {
                println!("{}", required(args.next(), "--stdout"));
            }
            "--stderr" => {
                eprintln!("{}", required(args.next(), "--stderr"));
            }
            "--exit-code" => {
                exit_code = parse_u64(args.next(), "--exit-code") as i32;
            }
            "--sleep-ms" => {
                let ms = parse_u64(args.next(), "--sleep-ms");
                thread::sleep(Duration::from_millis(ms));
            }
            "--spawn-child-sleep-ms" => {
                let ms = parse_u64(args.next(), "--spawn-child-sleep-ms");
                spawn_child_sleep(ms);
            }
            other => {
                eprintln!("unknown argument: {other}");
                process::exit(2);
            }
        }
    }
    process::exit(exit_code);
}
