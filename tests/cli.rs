use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::tempdir;

fn write_sessions(path: &Path) {
    let mut body =
        String::from("user,n_traj,speed,accuracy,wheels,clicks,daytime,weekday,valence,arousal,stress");
    for i in 0..60 {
        let speed = 0.6 + (i % 13) as f64 * 0.12;
        let accuracy = 0.3 + ((i * 7) % 11) as f64 * 0.06;
        let stress = u8::from((i * 5) % 9 < 4 || speed > 1.7 && i % 3 != 0);
        body.push_str(&format!(
            "\nuser{},{},{speed:.3},{accuracy:.3},{},{},{}.5,Mon,4,3,{stress}",
            i % 4,
            5 + (i % 20),
            i % 6,
            10 + i % 17,
            9 + i % 8,
        ));
    }
    fs::write(path, body).expect("write sessions");
}

fn mousestress() -> Command {
    Command::new(env!("CARGO_BIN_EXE_mousestress"))
}

#[test]
fn fit_writes_tables_and_report() {
    let tmp = tempdir().expect("temporary directory");
    let data = tmp.path().join("sessions.csv");
    write_sessions(&data);
    let out = tmp.path().join("out");

    let status = mousestress()
        .args([
            "fit",
            data.to_str().expect("path str"),
            "--out",
            out.to_str().expect("path str"),
            "--min-trajectories",
            "8",
            "--chains",
            "2",
            "--warmup",
            "150",
            "--draws",
            "150",
            "--seed",
            "3",
        ])
        .status()
        .expect("run mousestress");

    assert!(status.success(), "CLI exited with status {status:?}");
    for file in [
        "parameters.tsv",
        "loo.tsv",
        "fit_report.toml",
        "forest.svg",
        "trace.svg",
        "pareto_k.svg",
    ] {
        assert!(out.join(file).exists(), "{file} missing");
    }
    let parameters = fs::read_to_string(out.join("parameters.tsv")).expect("read parameters");
    assert!(parameters.starts_with("model\tparameter\tmean"));
    assert!(parameters.contains("mouse\tspeed\t"));
    let report = fs::read_to_string(out.join("fit_report.toml")).expect("read report");
    assert!(report.contains("model = \"mouse\""));
    assert!(report.contains("seed = 3"));
}

#[test]
fn unknown_model_fails_with_a_message() {
    let tmp = tempdir().expect("temporary directory");
    let data = tmp.path().join("sessions.csv");
    write_sessions(&data);

    let output = mousestress()
        .current_dir(tmp.path())
        .args(["fit", data.to_str().expect("path str"), "--model", "kitchen_sink", "--no-plots"])
        .output()
        .expect("run mousestress");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Unknown model 'kitchen_sink'"), "stderr: {stderr}");
}

#[test]
fn missing_column_is_reported() {
    let tmp = tempdir().expect("temporary directory");
    let data = tmp.path().join("broken.csv");
    fs::write(&data, "user,n_traj,speed\nu1,10,1.0\n").expect("write csv");

    let output = mousestress()
        .current_dir(tmp.path())
        .args(["describe", data.to_str().expect("path str"), "--no-plots"])
        .output()
        .expect("run mousestress");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("'accuracy'"), "stderr: {stderr}");
}
