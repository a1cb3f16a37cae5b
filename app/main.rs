use std::{
    fs::{read, write},
    io::stdout,
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::{Parser, Subcommand};
use revarchive::{
    archive::RevisionSelector,
    config::ServerConfig,
    dispatch::ArchiveDirectory,
    error::Result,
    header::ArchiveAttributes,
    request::{OperationKind, Payload, Request, Response},
    revision_id::RevisionId,
};

#[derive(Parser, Debug)]
#[clap(about = "work with single-file revision archives")]
struct Arguments {
    #[arg(short, long, help = "JSON server configuration file")]
    config: Option<PathBuf>,
    #[arg(long, help = "archive root, overriding the configuration")]
    root: Option<PathBuf>,
    #[arg(short, long, env = "USER", help = "user to act as")]
    user: String,
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(clap::Args, Debug)]
struct Selection {
    #[arg(short, long, help = "revision number, such as 1.3.1.2")]
    revision: Option<RevisionId>,
    #[arg(short, long, help = "revision a label points at")]
    label: Option<String>,
    #[arg(long, help = "newest revision checked in before this RFC 3339 time")]
    before: Option<chrono::DateTime<chrono::Utc>>,
}

impl Selection {
    fn selector(self) -> Option<RevisionSelector> {
        if let Some(id) = self.revision {
            Some(RevisionSelector::Id(id))
        } else if let Some(name) = self.label {
            Some(RevisionSelector::Label(name))
        } else {
            self.before.map(RevisionSelector::Date)
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    #[clap(about = "create an archive holding a workfile as revision 1.0")]
    Create {
        archive: PathBuf,
        workfile: PathBuf,
        #[arg(short, long, help = "module description")]
        description: Option<String>,
        #[arg(long, help = "keep 1.0 locked")]
        keep_locked: bool,
        #[arg(long, help = "allow check-in without locking")]
        no_lock_checking: bool,
        #[arg(long, help = "store revisions uncompressed")]
        no_compression: bool,
        #[arg(long, help = "store every revision whole")]
        no_deltas: bool,
        #[arg(long, help = "the workfile is not text")]
        binary: bool,
    },
    #[clap(about = "lock a revision and write its content")]
    Checkout {
        archive: PathBuf,
        #[command(flatten)]
        selection: Selection,
        #[arg(short, long, help = "write content here instead of stdout")]
        output: Option<PathBuf>,
    },
    #[clap(about = "store a workfile as a new revision")]
    Checkin {
        archive: PathBuf,
        workfile: PathBuf,
        #[arg(short, long, help = "revision description")]
        message: Option<String>,
        #[arg(short, long, help = "the locked revision, if not the one you hold")]
        revision: Option<RevisionId>,
        #[arg(long)]
        keep_locked: bool,
        #[arg(long, help = "start a new branch")]
        force_branch: bool,
        #[arg(long, help = "create a revision even when nothing changed")]
        force: bool,
        #[arg(short, long, help = "label to apply to the new revision")]
        label: Option<String>,
        #[arg(long, requires = "label")]
        floating: bool,
        #[arg(long, requires = "label")]
        reuse: bool,
    },
    #[clap(about = "lock a revision")]
    Lock {
        archive: PathBuf,
        #[command(flatten)]
        selection: Selection,
    },
    #[clap(about = "release a lock")]
    Unlock {
        archive: PathBuf,
        #[command(flatten)]
        selection: Selection,
    },
    #[clap(about = "apply a label")]
    Label {
        archive: PathBuf,
        name: String,
        #[command(flatten)]
        selection: Selection,
        #[arg(long, help = "copy the target of this label", conflicts_with_all = ["revision", "label", "before"])]
        duplicate_of: Option<String>,
        #[arg(long)]
        floating: bool,
        #[arg(long)]
        reuse: bool,
    },
    #[clap(about = "remove a label")]
    Unlabel { archive: PathBuf, name: String },
    #[clap(about = "mark an archive obsolete, or not")]
    Obsolete {
        archive: PathBuf,
        #[arg(action = clap::ArgAction::Set)]
        obsolete: bool,
    },
    #[clap(about = "change the module description, or a revision's")]
    Describe {
        archive: PathBuf,
        description: String,
        #[command(flatten)]
        selection: Selection,
    },
    #[clap(about = "write a revision's content without locking it")]
    Get {
        archive: PathBuf,
        #[command(flatten)]
        selection: Selection,
        #[arg(short, long, help = "write content here instead of stdout")]
        output: Option<PathBuf>,
    },
    #[clap(about = "show everything about an archive")]
    Info { archive: PathBuf },
    #[clap(about = "execute a JSON request read from a file")]
    Exec { file: PathBuf },
}

fn build_request(user: String, cmd: Command) -> Result<(Request, Option<PathBuf>)> {
    use Command::*;
    let mut output = None;
    let request = match cmd {
        Create {
            archive,
            workfile,
            description,
            keep_locked,
            no_lock_checking,
            no_compression,
            no_deltas,
            binary,
        } => {
            let mut request = Request::new(OperationKind::CreateArchive, archive, user);
            request.content = Some(Payload(read(&workfile)?));
            request.workfile_time = modified(&workfile);
            request.workfile_name = Some(workfile.display().to_string());
            request.description = description;
            request.keep_locked = Some(keep_locked);
            let attributes = ArchiveAttributes {
                check_lock: !no_lock_checking,
                compress: !no_compression,
                compute_delta: !no_deltas,
                binary,
            };
            if attributes != ArchiveAttributes::default() {
                request.attributes = Some(attributes);
            }
            request
        }
        Checkout {
            archive,
            selection,
            output: out,
        } => {
            output = out;
            let mut request = Request::new(OperationKind::CheckOut, archive, user);
            request.revision = selection.selector();
            request
        }
        Checkin {
            archive,
            workfile,
            message,
            revision,
            keep_locked,
            force_branch,
            force,
            label,
            floating,
            reuse,
        } => {
            let mut request = Request::new(OperationKind::CheckIn, archive, user);
            request.content = Some(Payload(read(&workfile)?));
            request.workfile_time = modified(&workfile);
            request.description = message;
            request.revision = revision.map(RevisionSelector::Id);
            request.keep_locked = Some(keep_locked);
            request.force_branch = Some(force_branch);
            request.create_new_revision_if_equal = Some(force);
            if label.is_some() {
                request.floating = Some(floating);
                request.reuse = Some(reuse);
            }
            request.label = label;
            request
        }
        Lock { archive, selection } => {
            let mut request = Request::new(OperationKind::Lock, archive, user);
            request.revision = selection.selector();
            request
        }
        Unlock { archive, selection } => {
            let mut request = Request::new(OperationKind::Unlock, archive, user);
            request.revision = selection.selector();
            request
        }
        Label {
            archive,
            name,
            selection,
            duplicate_of,
            floating,
            reuse,
        } => {
            let mut request = Request::new(OperationKind::Label, archive, user);
            request.label = Some(name);
            request.revision = selection.selector();
            request.duplicate_of = duplicate_of;
            request.floating = Some(floating);
            request.reuse = Some(reuse);
            request
        }
        Unlabel { archive, name } => {
            let mut request = Request::new(OperationKind::Unlabel, archive, user);
            request.label = Some(name);
            request
        }
        Obsolete { archive, obsolete } => {
            let mut request = Request::new(OperationKind::SetObsolete, archive, user);
            request.obsolete = Some(obsolete);
            request
        }
        Describe {
            archive,
            description,
            selection,
        } => {
            let (operation, revision) = match selection.selector() {
                Some(selector) => (OperationKind::SetRevisionDescription, Some(selector)),
                None => (OperationKind::SetModuleDescription, None),
            };
            let mut request = Request::new(operation, archive, user);
            request.description = Some(description);
            request.revision = revision;
            request
        }
        Get {
            archive,
            selection,
            output: out,
        } => {
            output = out;
            let mut request = Request::new(OperationKind::GetRevision, archive, user);
            request.revision = selection.selector();
            request
        }
        Info { archive } => Request::new(OperationKind::GetLogfileInfo, archive, user),
        Exec { file } => serde_json::from_slice(&read(&file)?)?,
    };
    Ok((request, output))
}

fn modified(path: &Path) -> Option<chrono::DateTime<chrono::Utc>> {
    let time = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(time.into())
}

fn run(args: Arguments) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(root) = args.root {
        config.archive_root = root;
    }
    let directory = ArchiveDirectory::open(&config)?;
    let (request, output) = build_request(args.user, args.cmd)?;
    let response = directory.execute(&request)?;
    match (response, output) {
        (Response::Content { revision, content }, Some(path)) => {
            write(&path, &content)?;
            log::info!("wrote revision {} to {:?}", revision, path);
            serde_json::to_writer_pretty(stdout(), &Response::Revision { revision })?;
        }
        (response, _) => serde_json::to_writer_pretty(stdout(), &response)?,
    }
    println!();
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Arguments::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", err);
            if err.is_fatal() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
