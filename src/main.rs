use clap::{Parser, Subcommand};
use rust_hl7_codec::{
    adt::{Address, AdmissionSummary, CodedValue, Doctor, Location, PatientAdmission},
    hl7_timestamp, new_control_id, validate, Decoder, Delimiters, Message, StructureSpec,
    ValidationIssue,
};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "rust-hl7-codec")]
#[command(about = "Encode, decode and validate HL7v2 messages", long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an ADT^A01, encode it, decode it back and show its contents
    Demo,

    /// Decode an HL7 message from a file ("-" for stdin)
    Decode {
        input: PathBuf,

        /// Print the decoded message as JSON
        #[arg(long)]
        json: bool,

        /// Extra structure spec (TOML) merged over the built-in ones
        #[arg(long)]
        structures: Option<PathBuf>,

        /// Reject segments with more fields than their structure defines
        #[arg(long)]
        strict: bool,
    },

    /// Encode a JSON message (as printed by `decode --json`) to wire format
    Encode {
        input: PathBuf,

        /// Show segments on separate lines instead of raw `\r` terminators
        #[arg(long)]
        display: bool,
    },

    /// Validate an HL7 message against its structure spec
    Validate {
        input: PathBuf,

        /// Extra structure spec (TOML) merged over the built-in ones
        #[arg(long)]
        structures: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Set up logging
    let _guard = init_logging(cli.verbose, cli.log_file.as_deref())?;

    match cli.command {
        Commands::Demo => run_demo()?,
        Commands::Decode {
            input,
            json,
            structures,
            strict,
        } => {
            let spec = load_structures(structures.as_deref())?;
            let decoder = if strict {
                Decoder::strict(spec)
            } else {
                Decoder::new()
            };
            let message = decoder.decode(&read_input(&input)?)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&message)?);
            } else {
                print_segments(&message)?;
            }
        }
        Commands::Encode { input, display } => {
            let message: Message = serde_json::from_str(&read_input(&input)?)?;
            let wire = message.encode()?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(render_wire(&wire, display).as_bytes())?;
            stdout.flush()?;
        }
        Commands::Validate { input, structures } => {
            let spec = load_structures(structures.as_deref())?;
            let message = Message::parse(&read_input(&input)?)?;
            let issues = validate(&message, &spec);
            print_issues(&issues);
            if !issues.is_empty() {
                return Err(format!("{} structure issue(s) found", issues.len()).into());
            }
        }
    }

    Ok(())
}

fn init_logging(
    verbose: bool,
    log_file: Option<&Path>,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    match log_file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| format!("log file path {} has no file name", path.display()))?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(writer)
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
            Ok(Some(guard))
        }
        None => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
            Ok(None)
        }
    }
}

/// Wire text as written to stdout; `display` swaps `\r` for newlines.
fn render_wire(wire: &str, display: bool) -> String {
    if display {
        wire.replace('\r', "\n")
    } else {
        wire.to_string()
    }
}

fn read_input(path: &Path) -> Result<String, std::io::Error> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        Ok(text)
    } else {
        std::fs::read_to_string(path)
    }
}

fn load_structures(path: Option<&Path>) -> Result<StructureSpec, Box<dyn std::error::Error>> {
    let mut spec = StructureSpec::standard();
    if let Some(path) = path {
        info!("Loading structure spec from {}", path.display());
        spec.merge(StructureSpec::from_path(path)?);
    }
    Ok(spec)
}

/// The admission the demo sends: one inpatient in ICU, stamped now.
fn demo_admission() -> PatientAdmission {
    let now = hl7_timestamp(&chrono::Local::now());
    PatientAdmission {
        sending_application: "HIS_SYS".to_string(),
        sending_facility: "HOSPITAL_A".to_string(),
        receiving_application: "EMR_SYS".to_string(),
        receiving_facility: "CLINIC_B".to_string(),
        timestamp: now,
        control_id: new_control_id(),
        processing_id: "P".to_string(),
        version: "2.5.1".to_string(),
        patient_id: "PAT-123456".to_string(),
        assigning_authority: "HOSPITAL_A".to_string(),
        family_name: "Smith".to_string(),
        given_name: "John".to_string(),
        date_of_birth: "19800115".to_string(),
        sex: "M".to_string(),
        race: CodedValue {
            identifier: "2106-3".to_string(),
            text: "White".to_string(),
            coding_system: "CDCREC".to_string(),
        },
        address: Address {
            street: "123 MAIN ST".to_string(),
            city: "ANYTOWN".to_string(),
            state: "CA".to_string(),
            zip: "90210".to_string(),
            country: "USA".to_string(),
        },
        set_id: "1".to_string(),
        patient_class: "I".to_string(),
        location: Location {
            point_of_care: "ICU".to_string(),
            room: "BED-01".to_string(),
            facility: "HOSPITAL_A".to_string(),
        },
        attending_doctor: Doctor {
            id: "DOC-987".to_string(),
            family_name: "Williams".to_string(),
            given_name: "Sarah".to_string(),
            identifier_type: "MD".to_string(),
        },
        admission_type: "EMER".to_string(),
        vip_indicator: "N".to_string(),
    }
}

/// Generate, print, decode and display an ADT^A01
fn run_demo() -> Result<(), Box<dyn std::error::Error>> {
    let message = demo_admission().to_message(Delimiters::default())?;
    let wire = message.encode()?;

    println!("Generated HL7 ADT^A01 Message:");
    print!("{}", render_wire(&wire, true));

    let decoded = Message::parse(&wire)?;
    if decoded != message {
        warn!("Decoded message differs from the one that was encoded");
    }

    let summary = AdmissionSummary::from_hl7(&decoded)?;
    print_summary(&summary);

    let issues = validate(&decoded, &StructureSpec::standard());
    print_issues(&issues);
    Ok(())
}

fn show(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}

fn print_summary(summary: &AdmissionSummary) {
    println!("Processing MSH segment:");
    println!("Sending Application: {}", show(&summary.sending_application));
    println!("Sending Facility: {}", show(&summary.sending_facility));
    println!("Receiving Application: {}", show(&summary.receiving_application));
    println!("Receiving Facility: {}", show(&summary.receiving_facility));
    println!("Message Type: {}", summary.message_type);
    println!("Message Control ID: {}", show(&summary.control_id));
    println!("Version ID: {}", show(&summary.version));

    println!("Processing EVN segment:");
    println!("Event Type Code: {}", show(&summary.event_type));
    println!("Recorded Date/Time: {}", show(&summary.recorded_at));

    println!("Processing PID segment:");
    println!("Patient ID: {}", summary.patient_id);
    println!(
        "Patient Name: {}, {}",
        show(&summary.family_name),
        show(&summary.given_name)
    );
    println!("Date of Birth: {}", show(&summary.date_of_birth));
    println!("Sex: {}", show(&summary.sex));
    println!("Race: {}", show(&summary.race));
    println!(
        "Address: {}, {}, {} {}",
        show(&summary.street),
        show(&summary.city),
        show(&summary.state),
        show(&summary.zip)
    );

    println!("Processing PV1 segment:");
    println!("Set ID Patient Visit: {}", show(&summary.set_id));
    println!("Patient Class: {}", show(&summary.patient_class));
    println!("Assigned Patient Location: {}", show(&summary.point_of_care));
    println!("Attending Doctor: {}", show(&summary.attending_doctor));
}

fn print_segments(message: &Message) -> Result<(), Box<dyn std::error::Error>> {
    let delimiters = message.delimiters()?;
    if let (Some(message_type), Some(trigger)) = (message.message_type(), message.trigger_event()) {
        println!("Message type: {}^{}", message_type, trigger);
    }
    if let Some(version) = message.version() {
        println!("Version: {}", version);
    }
    for segment in message.segments() {
        println!("{}", segment.code());
        let first = if segment.is_msh() { 3 } else { 1 };
        for (i, field) in segment.fields().iter().enumerate().skip(first - 1) {
            if !field.is_empty() {
                println!("  {}-{}: {}", segment.code(), i + 1, field.to_wire(&delimiters));
            }
        }
    }
    Ok(())
}

fn print_issues(issues: &[ValidationIssue]) {
    if issues.is_empty() {
        println!("Structure: valid");
        return;
    }
    println!("Structure issues:");
    for issue in issues {
        println!("  {}", issue);
    }
}
