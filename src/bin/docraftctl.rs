use anyhow::Result;
use clap::{Parser, Subcommand};
use reqwest::{Method, StatusCode};
use serde_json::Value;

const MAX_REDIRECTS: usize = 3;

#[derive(Parser)]
#[command(name = "docraftctl")]
#[command(about = "CLI for a docraft cluster")]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:7000")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Status,
    Cluster,

    Register {
        #[arg(short, long)]
        username: String,

        #[arg(short, long)]
        password: String,
    },

    Login {
        #[arg(short, long)]
        username: String,

        #[arg(short, long)]
        password: String,
    },

    Users {
        #[arg(short, long)]
        username: String,
    },

    #[command(subcommand)]
    Doc(DocCommands),
}

#[derive(Subcommand)]
enum DocCommands {
    List {
        #[arg(short, long)]
        username: String,
    },
    Create {
        #[arg(short, long)]
        username: String,

        #[arg(short, long)]
        title: String,
    },
    Get {
        id: String,

        #[arg(short, long)]
        username: String,
    },
    Edit {
        id: String,

        #[arg(short, long)]
        username: String,

        #[arg(short, long)]
        content: String,

        /// Content the edit started from; enables merging with concurrent edits
        #[arg(short, long)]
        base: Option<String>,
    },
    Title {
        id: String,

        #[arg(short, long)]
        username: String,

        #[arg(short, long)]
        title: String,
    },
    Delete {
        id: String,

        #[arg(short, long)]
        username: String,
    },
    Share {
        id: String,

        #[arg(short, long)]
        owner: String,

        #[arg(short, long)]
        username: String,
    },
    Unshare {
        id: String,

        #[arg(short, long)]
        owner: String,

        #[arg(short, long)]
        username: String,
    },
}

struct Client {
    http: reqwest::Client,
    base_url: String,
}

impl Client {
    /// Sends the request, re-issuing it against the leader when a follower
    /// answers with a redirect.
    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let mut url = format!("{}{}", self.base_url.trim_end_matches('/'), path);

        for _ in 0..=MAX_REDIRECTS {
            let mut req = self.http.request(method.clone(), &url);
            if let Some(body) = &body {
                req = req.json(body);
            }
            let resp = req.send().await?;

            if resp.status() == StatusCode::TEMPORARY_REDIRECT {
                let location = resp
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                match location {
                    Some(location) => {
                        eprintln!("redirected to leader: {}", location);
                        url = location;
                        continue;
                    }
                    None => anyhow::bail!("redirect without a leader location"),
                }
            }

            return Ok(resp.json().await?);
        }

        anyhow::bail!("too many redirects; the cluster may be electing a leader")
    }
}

fn print(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = Client {
        http: reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?,
        base_url: cli.addr,
    };

    let resp = match cli.command {
        Commands::Status => client.send(Method::GET, "/api/server/status", None).await?,
        Commands::Cluster => client.send(Method::GET, "/api/cluster/status", None).await?,
        Commands::Register { username, password } => {
            let body = serde_json::json!({ "username": username, "password": password });
            client.send(Method::POST, "/api/register", Some(body)).await?
        }
        Commands::Login { username, password } => {
            let body = serde_json::json!({ "username": username, "password": password });
            client.send(Method::POST, "/api/login", Some(body)).await?
        }
        Commands::Users { username } => {
            client
                .send(Method::GET, &format!("/api/users?username={}", username), None)
                .await?
        }
        Commands::Doc(cmd) => match cmd {
            DocCommands::List { username } => {
                client
                    .send(Method::GET, &format!("/api/documents?username={}", username), None)
                    .await?
            }
            DocCommands::Create { username, title } => {
                let body = serde_json::json!({ "username": username, "title": title });
                client.send(Method::POST, "/api/documents", Some(body)).await?
            }
            DocCommands::Get { id, username } => {
                client
                    .send(
                        Method::GET,
                        &format!("/api/documents/{}?username={}", id, username),
                        None,
                    )
                    .await?
            }
            DocCommands::Edit {
                id,
                username,
                content,
                base,
            } => {
                let body = serde_json::json!({
                    "username": username,
                    "content": content,
                    "base_content": base,
                });
                client
                    .send(Method::PUT, &format!("/api/documents/{}/content", id), Some(body))
                    .await?
            }
            DocCommands::Title { id, username, title } => {
                let body = serde_json::json!({ "username": username, "title": title });
                client
                    .send(Method::PUT, &format!("/api/documents/{}/title", id), Some(body))
                    .await?
            }
            DocCommands::Delete { id, username } => {
                client
                    .send(
                        Method::DELETE,
                        &format!("/api/documents/{}?username={}", id, username),
                        None,
                    )
                    .await?
            }
            DocCommands::Share { id, owner, username } => {
                let body = serde_json::json!({ "owner_username": owner, "username": username });
                client
                    .send(Method::POST, &format!("/api/documents/{}/users", id), Some(body))
                    .await?
            }
            DocCommands::Unshare { id, owner, username } => {
                client
                    .send(
                        Method::DELETE,
                        &format!("/api/documents/{}/users/{}?owner_username={}", id, username, owner),
                        None,
                    )
                    .await?
            }
        },
    };

    print(&resp)
}
