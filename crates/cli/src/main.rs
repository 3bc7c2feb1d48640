use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use base64::Engine;
use clap::{Args, Parser, Subcommand};
use msgbackup_core::codec::{ForwardSecrecyMetadata, PlaintextBackupWriter};
use msgbackup_core::config::{Settings, load_settings};
use msgbackup_core::coordinator::load_progress_record;
use msgbackup_core::run_log::{RunKind, RunStatus, start_run_log};
use msgbackup_core::store::FileKeyValueStore;
use msgbackup_core::{
    APP_NAME, AccountId, BackupCredentials, BackupKey, EncryptedBackupWriter, ErrorKind,
    ForwardSecrecyToken, FrameReader, RestorePhase, inspect_encrypted, load_restore_phase,
    open_backup, save_restore_phase,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "msgbackup")]
#[command(about = "Message backup archive tool (encode, decode, inspect persisted state)", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long, env = "MSGBACKUP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Encrypt {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        plaintext: bool,
        /// Opaque forward-secrecy metadata to embed (base64).
        #[arg(long)]
        fs_metadata: Option<String>,
        #[command(flatten)]
        keys: KeyArgs,
    },
    Decrypt {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        plaintext: bool,
        #[command(flatten)]
        keys: KeyArgs,
    },
    Inspect {
        #[arg(long)]
        input: PathBuf,
    },
    Progress {
        #[command(subcommand)]
        cmd: ProgressCmd,
    },
    RestorePhase {
        #[command(subcommand)]
        cmd: RestorePhaseCmd,
    },
    Key {
        #[command(subcommand)]
        cmd: KeyCmd,
    },
}

#[derive(Subcommand)]
enum ProgressCmd {
    Show,
}

#[derive(Subcommand)]
enum RestorePhaseCmd {
    Get,
    Set { phase: String },
}

#[derive(Subcommand)]
enum KeyCmd {
    Generate,
}

#[derive(Args)]
struct KeyArgs {
    #[arg(long, env = "MSGBACKUP_BACKUP_KEY", hide_env_values = true)]
    backup_key: Option<String>,
    #[arg(long)]
    account_id: Option<Uuid>,
    /// Forward-secrecy token from the recovery exchange (base64).
    #[arg(long)]
    fs_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FrameLine {
    frame: String,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<(), CliError> {
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let settings = load_settings(&data_dir).map_err(map_core_err)?;

    match cli.cmd {
        Command::Encrypt {
            input,
            output,
            plaintext,
            fs_metadata,
            keys,
        } => encrypt(
            &data_dir,
            &settings,
            &input,
            &output,
            plaintext,
            fs_metadata,
            keys,
            cli.json,
        ),
        Command::Decrypt {
            input,
            output,
            plaintext,
            keys,
        } => decrypt(&data_dir, &settings, &input, &output, plaintext, keys, cli.json),
        Command::Inspect { input } => inspect(&input, cli.json),
        Command::Progress { cmd } => match cmd {
            ProgressCmd::Show => progress_show(&data_dir, &settings, cli.json),
        },
        Command::RestorePhase { cmd } => match cmd {
            RestorePhaseCmd::Get => restore_phase_get(&data_dir, &settings, cli.json),
            RestorePhaseCmd::Set { phase } => {
                restore_phase_set(&data_dir, &settings, &phase, cli.json)
            }
        },
        Command::Key { cmd } => match cmd {
            KeyCmd::Generate => key_generate(cli.json),
        },
    }
}

#[allow(clippy::too_many_arguments)]
fn encrypt(
    data_dir: &Path,
    settings: &Settings,
    input: &Path,
    output: &Path,
    plaintext: bool,
    fs_metadata: Option<String>,
    keys: KeyArgs,
    json: bool,
) -> Result<(), CliError> {
    let run_id = format!("run_{}", Uuid::new_v4().simple());
    let log = start_run_log(RunKind::Export, &run_id, data_dir)
        .map_err(|e| CliError::new("log.unavailable", e.to_string()))?;

    let frames = read_frame_lines(input)?;
    let codec = settings.codec_settings();
    let sink = BufWriter::new(
        File::create(output).map_err(|e| CliError::new("io.write_failed", e.to_string()))?,
    );

    let sink = if plaintext {
        let mut writer = PlaintextBackupWriter::new(sink, &codec).map_err(map_core_err)?;
        for frame in &frames {
            writer.write_frame(frame).map_err(map_core_err)?;
        }
        writer.finish().map_err(map_core_err)?
    } else {
        let credentials = credentials(keys)?;
        let metadata_b64 = fs_metadata
            .ok_or_else(|| CliError::new("config.invalid", "--fs-metadata is required"))?;
        let metadata = ForwardSecrecyMetadata::new(decode_b64(&metadata_b64, "--fs-metadata")?)
            .map_err(map_core_err)?;
        let derived = credentials.derive_keys().map_err(map_core_err)?;

        let mut writer =
            EncryptedBackupWriter::new(sink, &derived, &metadata, &codec).map_err(map_core_err)?;
        for frame in &frames {
            writer.write_frame(frame).map_err(map_core_err)?;
        }
        writer.finish().map_err(map_core_err)?
    };
    sink.into_inner()
        .map_err(|e| CliError::new("io.write_failed", e.to_string()))?
        .sync_all()
        .map_err(|e| CliError::new("io.write_failed", e.to_string()))?;

    info!(
        event = "cli.encrypt.finish",
        run_id = %run_id,
        frames = frames.len(),
        plaintext,
        "cli.encrypt.finish"
    );
    if json {
        println!(
            "{}",
            serde_json::json!({ "frames": frames.len(), "output": output, "plaintext": plaintext })
        );
    } else {
        println!("wrote {} frames to {}", frames.len(), output.display());
    }
    log.finish(RunStatus::Succeeded)
        .map_err(|e| CliError::new("log.unavailable", e.to_string()))
}

fn decrypt(
    data_dir: &Path,
    settings: &Settings,
    input: &Path,
    output: &Path,
    plaintext: bool,
    keys: KeyArgs,
    json: bool,
) -> Result<(), CliError> {
    let run_id = format!("run_{}", Uuid::new_v4().simple());
    let log = start_run_log(RunKind::Restore, &run_id, data_dir)
        .map_err(|e| CliError::new("log.unavailable", e.to_string()))?;

    let source = BufReader::new(
        File::open(input).map_err(|e| CliError::new("io.read_failed", e.to_string()))?,
    );
    let credentials = if plaintext { None } else { Some(credentials(keys)?) };
    let reader = open_backup(source, credentials.as_ref(), &settings.codec_settings())
        .map_err(map_core_err)?;
    let version = reader.version();
    let frames = write_frame_lines(reader, output)?;

    info!(event = "cli.decrypt.finish", run_id = %run_id, frames, "cli.decrypt.finish");
    if json {
        println!(
            "{}",
            serde_json::json!({ "frames": frames, "version": version, "output": output })
        );
    } else {
        println!("decoded {frames} frames to {}", output.display());
    }
    log.finish(RunStatus::Succeeded)
        .map_err(|e| CliError::new("log.unavailable", e.to_string()))
}

fn inspect(input: &Path, json: bool) -> Result<(), CliError> {
    let mut source = BufReader::new(
        File::open(input).map_err(|e| CliError::new("io.read_failed", e.to_string()))?,
    );
    let layout = inspect_encrypted(&mut source).map_err(map_core_err)?;
    let metadata_hex = hex::encode(layout.metadata.as_bytes());
    if json {
        println!(
            "{}",
            serde_json::json!({
                "totalLen": layout.total_len,
                "metadataLen": layout.metadata_len,
                "ciphertextLen": layout.ciphertext_len,
                "metadataHex": metadata_hex,
            })
        );
    } else {
        println!("total_len={}", layout.total_len);
        println!("metadata_len={}", layout.metadata_len);
        println!("ciphertext_len={}", layout.ciphertext_len);
        println!("metadata={metadata_hex}");
    }
    Ok(())
}

fn progress_show(data_dir: &Path, settings: &Settings, json: bool) -> Result<(), CliError> {
    let store = open_store(data_dir, settings)?;
    let record = load_progress_record(&store).map_err(map_core_err)?;
    if json {
        println!(
            "{}",
            serde_json::json!({
                "state": record.state.as_str(),
                "phase": record.phase.map(|p| p.as_str()),
                "inProgress": record.in_progress(),
                "backupFileUploadedBytes": record.backup_file_uploaded_bytes,
                "backupFileTotalBytes": record.backup_file_total_bytes,
                "mediaUploadedBytes": record.media_uploaded_bytes,
                "mediaTotalBytes": record.media_total_bytes,
                "frameExportCount": record.frame_export_count,
                "frameExportTotal": record.frame_export_total,
            })
        );
    } else {
        println!("state={}", record.state.as_str());
        if let Some(phase) = record.phase {
            println!("phase={}", phase.as_str());
        }
        println!(
            "backup_file={}/{}",
            record.backup_file_uploaded_bytes, record.backup_file_total_bytes
        );
        println!(
            "media={}/{}",
            record.media_uploaded_bytes, record.media_total_bytes
        );
    }
    Ok(())
}

fn restore_phase_get(data_dir: &Path, settings: &Settings, json: bool) -> Result<(), CliError> {
    let store = open_store(data_dir, settings)?;
    let phase = load_restore_phase(&store).map_err(map_core_err)?;
    print_phase(phase, json);
    Ok(())
}

fn restore_phase_set(
    data_dir: &Path,
    settings: &Settings,
    phase: &str,
    json: bool,
) -> Result<(), CliError> {
    let phase: RestorePhase = phase.parse().map_err(map_core_err)?;
    let store = open_store(data_dir, settings)?;
    save_restore_phase(&store, phase).map_err(map_core_err)?;
    print_phase(phase, json);
    Ok(())
}

fn print_phase(phase: RestorePhase, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::json!({
                "phase": phase.as_str(),
                "inProgress": phase.in_progress(),
                "isMediaRestoreOperation": phase.is_media_restore_operation(),
            })
        );
    } else {
        println!("{phase}");
    }
}

fn key_generate(json: bool) -> Result<(), CliError> {
    let mut bytes = [0u8; 32];
    getrandom::getrandom(&mut bytes).map_err(|e| CliError::new("crypto.rng_failed", e.to_string()))?;
    let key = BackupKey::from_bytes(bytes).encode();
    if json {
        println!("{}", serde_json::json!({ "backupKey": key }));
    } else {
        println!("{key}");
    }
    Ok(())
}

fn credentials(keys: KeyArgs) -> Result<BackupCredentials, CliError> {
    let backup_key = keys
        .backup_key
        .ok_or_else(|| CliError::new("config.invalid", "--backup-key is required"))?;
    let backup_key = BackupKey::parse(&backup_key).map_err(map_core_err)?;
    let account_id = keys
        .account_id
        .ok_or_else(|| CliError::new("config.invalid", "--account-id is required"))?;
    let forward_secrecy_token = match keys.fs_token {
        Some(b64) => Some(
            ForwardSecrecyToken::from_slice(&decode_b64(&b64, "--fs-token")?)
                .map_err(map_core_err)?,
        ),
        None => None,
    };
    Ok(BackupCredentials {
        backup_key,
        account_id: AccountId(account_id),
        forward_secrecy_token,
    })
}

fn read_frame_lines(path: &Path) -> Result<Vec<Vec<u8>>, CliError> {
    let file = File::open(path).map_err(|e| CliError::new("io.read_failed", e.to_string()))?;
    let mut frames = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| CliError::new("io.read_failed", e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: FrameLine = serde_json::from_str(&line).map_err(|e| {
            CliError::new("input.invalid", format!("line {}: {e}", idx + 1))
        })?;
        frames.push(decode_b64(&parsed.frame, "frame")?);
    }
    Ok(frames)
}

fn write_frame_lines(reader: FrameReader<'_>, path: &Path) -> Result<usize, CliError> {
    let file = File::create(path).map_err(|e| CliError::new("io.write_failed", e.to_string()))?;
    let mut out = BufWriter::new(file);
    let mut count = 0usize;
    for frame in reader {
        let frame = frame.map_err(map_core_err)?;
        let line = FrameLine {
            frame: base64::engine::general_purpose::STANDARD.encode(&frame),
        };
        let text = serde_json::to_string(&line)
            .map_err(|e| CliError::new("io.write_failed", e.to_string()))?;
        writeln!(out, "{text}").map_err(|e| CliError::new("io.write_failed", e.to_string()))?;
        count += 1;
    }
    out.flush()
        .map_err(|e| CliError::new("io.write_failed", e.to_string()))?;
    Ok(count)
}

fn decode_b64(value: &str, what: &str) -> Result<Vec<u8>, CliError> {
    base64::engine::general_purpose::STANDARD
        .decode(value.trim().as_bytes())
        .map_err(|e| CliError::new("input.invalid", format!("{what}: invalid base64: {e}")))
}

fn open_store(data_dir: &Path, settings: &Settings) -> Result<FileKeyValueStore, CliError> {
    FileKeyValueStore::open(data_dir.join("kv"), settings.store_write_options())
        .map_err(map_core_err)
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".local").join("share").join(APP_NAME)
}

fn map_core_err(e: msgbackup_core::Error) -> CliError {
    let user_message = e.user_message();
    let mut err = match e.kind() {
        ErrorKind::Config => CliError::new("config.invalid", e.to_string()),
        ErrorKind::Integrity => CliError::new("backup.integrity", e.to_string()),
        ErrorKind::Truncated => CliError::new("backup.truncated", e.to_string()),
        ErrorKind::Format => CliError::new("backup.format", e.to_string()),
        ErrorKind::Storage => CliError::new("store.failed", e.to_string()),
        ErrorKind::Io => CliError::retryable("io.failed", e.to_string()),
    };
    if let Some(user_message) = user_message {
        err.details = serde_json::json!({ "userMessage": user_message });
    }
    err
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}
