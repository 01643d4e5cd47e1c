use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use postline::net::types::{ListingKind, PasswordChange, Post, PostDraft, ProfileUpdate, Registration, Upload};
use postline::state::feed::{Feed, FeedKind};
use postline::{ApiClient, ApiError, AuthFailure, AuthSession, ClientConfig, FileSessionStore, MediaKind, SessionStore};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("could not read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "postline", about = "postline social network API CLI")]
struct Cli {
    /// API root; defaults to `POSTLINE_API_URL` or the local dev server.
    #[arg(long)]
    api_url: Option<String>,

    /// Credential file; defaults to `POSTLINE_SESSION_FILE` or the data dir.
    #[arg(long)]
    session_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and store the credential pair.
    Login {
        username: String,
        #[arg(long, env = "POSTLINE_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Log in with an external identity token.
    GoogleLogin { token: String },
    Register(RegisterArgs),
    Logout,
    /// Show the logged-in user.
    Whoami,
    Password(PasswordCommand),
    Account(AccountCommand),
    Posts(PostsCommand),
    Users(UsersCommand),
    Profile(ProfileCommand),
}

#[derive(Args, Debug)]
struct RegisterArgs {
    #[arg(long)]
    username: String,
    #[arg(long)]
    email: String,
    #[arg(long, env = "POSTLINE_PASSWORD", hide_env_values = true)]
    password: String,
    /// Defaults to `--password`.
    #[arg(long)]
    confirm_password: Option<String>,
    #[arg(long, default_value = "")]
    bio: String,
    #[arg(long)]
    avatar: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct PasswordCommand {
    #[command(subcommand)]
    command: PasswordSubcommand,
}

#[derive(Subcommand, Debug)]
enum PasswordSubcommand {
    Change {
        #[arg(long)]
        old: String,
        #[arg(long)]
        new: String,
        /// Defaults to `--new`.
        #[arg(long)]
        confirm: Option<String>,
    },
    /// Mail a password reset link.
    Reset { email: String },
}

#[derive(Args, Debug)]
struct AccountCommand {
    #[command(subcommand)]
    command: AccountSubcommand,
}

#[derive(Subcommand, Debug)]
enum AccountSubcommand {
    Delete {
        #[arg(long, env = "POSTLINE_PASSWORD", hide_env_values = true)]
        password: String,
    },
}

#[derive(Args, Debug)]
struct PostsCommand {
    #[command(subcommand)]
    command: PostsSubcommand,
}

#[derive(Subcommand, Debug)]
enum PostsSubcommand {
    List {
        #[arg(long, default_value = "")]
        search: String,
        /// Only the current user's posts.
        #[arg(long, default_value_t = false)]
        mine: bool,
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    Show {
        id: u64,
    },
    Create(DraftArgs),
    Update {
        id: u64,
        #[command(flatten)]
        draft: DraftArgs,
    },
    Delete {
        id: u64,
    },
    /// Toggle the like on a post.
    Like {
        id: u64,
    },
    Comment {
        id: u64,
        text: String,
    },
}

#[derive(Args, Debug)]
struct DraftArgs {
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    content: String,
    #[arg(long)]
    image: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct UsersCommand {
    #[command(subcommand)]
    command: UsersSubcommand,
}

#[derive(Subcommand, Debug)]
enum UsersSubcommand {
    Profile {
        username: String,
    },
    Search {
        query: String,
    },
    Suggestions,
    Follow {
        user_id: u64,
    },
    Unfollow {
        user_id: u64,
    },
    Followers(ListingArgs),
    Following(ListingArgs),
}

#[derive(Args, Debug)]
struct ListingArgs {
    #[arg(long, default_value = "")]
    search: String,
    #[arg(long, default_value_t = 1)]
    page: u32,
}

#[derive(Args, Debug)]
struct ProfileCommand {
    #[command(subcommand)]
    command: ProfileSubcommand,
}

#[derive(Subcommand, Debug)]
enum ProfileSubcommand {
    Update {
        #[arg(long)]
        bio: Option<String>,
        #[arg(long)]
        avatar: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env();
    if let Some(url) = cli.api_url {
        config.base_url = url.trim_end_matches('/').to_owned();
    }
    if let Some(path) = cli.session_file {
        config = config.with_session_file(path);
    }

    let store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::new(config.session_file.clone()));
    let api = ApiClient::new(config, store)?;
    let auth = AuthSession::new(api.clone());

    match cli.command {
        Command::Login { username, password } => print_json(&auth.login(&username, &password).await?),
        Command::GoogleLogin { token } => print_json(&auth.login_with_federated_token(&token).await?),
        Command::Register(args) => run_register(&auth, args).await,
        Command::Logout => {
            auth.logout();
            println!("ok");
            Ok(())
        }
        Command::Whoami => match auth.init().await.user() {
            Some(user) => print_json(user),
            None => Err(ApiError::Authentication(AuthFailure::NotLoggedIn).into()),
        },
        Command::Password(password) => run_password(&auth, password).await,
        Command::Account(account) => run_account(&auth, account).await,
        Command::Posts(posts) => run_posts(&api, posts).await,
        Command::Users(users) => run_users(&api, users).await,
        Command::Profile(profile) => run_profile(&auth, profile).await,
    }
}

async fn run_register(auth: &AuthSession, args: RegisterArgs) -> Result<(), CliError> {
    let confirm_password = args.confirm_password.unwrap_or_else(|| args.password.clone());
    let form = Registration {
        username: args.username,
        email: args.email,
        password: args.password,
        confirm_password,
        bio: args.bio,
        avatar: args.avatar.as_deref().map(read_upload).transpose()?,
    };
    print_json(&auth.register(&form).await?)
}

async fn run_password(auth: &AuthSession, password: PasswordCommand) -> Result<(), CliError> {
    match password.command {
        PasswordSubcommand::Change { old, new, confirm } => {
            let confirm_password = confirm.unwrap_or_else(|| new.clone());
            let form = PasswordChange { old_password: old, new_password: new, confirm_password };
            auth.change_password(&form).await?;
            println!("password changed; log in again");
        }
        PasswordSubcommand::Reset { email } => {
            auth.request_password_reset(&email).await?;
            println!("reset link sent");
        }
    }
    Ok(())
}

async fn run_account(auth: &AuthSession, account: AccountCommand) -> Result<(), CliError> {
    match account.command {
        AccountSubcommand::Delete { password } => {
            auth.delete_account(&password).await?;
            println!("account deleted");
            Ok(())
        }
    }
}

async fn run_posts(api: &ApiClient, posts: PostsCommand) -> Result<(), CliError> {
    match posts.command {
        PostsSubcommand::List { search, mine, page } => {
            let feed = Feed::new(api.clone(), if mine { FeedKind::Mine } else { FeedKind::All });
            feed.load(&search).await?;
            for _ in 1..page {
                if !feed.load_next().await? {
                    break;
                }
            }
            let state = feed.snapshot();
            let posts = state.posts.iter().map(|post| post_json(api, post)).collect::<Result<Vec<_>, _>>()?;
            print_json(&serde_json::json!({
                "count": state.count,
                "next": state.next,
                "previous": state.previous,
                "results": posts,
            }))
        }
        PostsSubcommand::Show { id } => print_json(&post_json(api, &api.post(id).await?)?),
        PostsSubcommand::Create(args) => {
            let post = api.create_post(&read_draft(args)?).await?;
            print_json(&post_json(api, &post)?)
        }
        PostsSubcommand::Update { id, draft } => {
            let post = api.update_post(id, &read_draft(draft)?).await?;
            print_json(&post_json(api, &post)?)
        }
        PostsSubcommand::Delete { id } => {
            api.delete_post(id).await?;
            println!("deleted");
            Ok(())
        }
        PostsSubcommand::Like { id } => {
            api.like_post(id).await?;
            let post = api.post(id).await?;
            print_json(&serde_json::json!({ "id": post.id, "is_liked": post.is_liked, "likes_count": post.likes_count }))
        }
        PostsSubcommand::Comment { id, text } => print_json(&api.comment_post(id, &text).await?),
    }
}

async fn run_users(api: &ApiClient, users: UsersCommand) -> Result<(), CliError> {
    use postline::net::types::FollowAction;

    match users.command {
        UsersSubcommand::Profile { username } => print_json(&api.user_profile(&username).await?),
        UsersSubcommand::Search { query } => print_json(&api.search_users(query.trim()).await?),
        UsersSubcommand::Suggestions => print_json(&api.suggestions().await?),
        UsersSubcommand::Follow { user_id } => {
            api.set_following(user_id, FollowAction::Follow).await?;
            println!("following {user_id}");
            Ok(())
        }
        UsersSubcommand::Unfollow { user_id } => {
            api.set_following(user_id, FollowAction::Unfollow).await?;
            println!("unfollowed {user_id}");
            Ok(())
        }
        UsersSubcommand::Followers(args) => {
            print_json(&api.follow_listing(ListingKind::Followers, args.search.trim(), args.page).await?)
        }
        UsersSubcommand::Following(args) => {
            print_json(&api.follow_listing(ListingKind::Following, args.search.trim(), args.page).await?)
        }
    }
}

async fn run_profile(auth: &AuthSession, profile: ProfileCommand) -> Result<(), CliError> {
    match profile.command {
        ProfileSubcommand::Update { bio, avatar } => {
            let update = ProfileUpdate { bio, avatar: avatar.as_deref().map(read_upload).transpose()? };
            auth.api().update_profile(&update).await?;
            print_json(&auth.refresh_user().await?)
        }
    }
}

fn read_draft(args: DraftArgs) -> Result<PostDraft, CliError> {
    Ok(PostDraft {
        title: args.title,
        content: args.content,
        image: args.image.as_deref().map(read_upload).transpose()?,
    })
}

fn read_upload(path: &Path) -> Result<Upload, CliError> {
    let bytes = std::fs::read(path).map_err(|source| CliError::ReadFile { path: path.to_owned(), source })?;
    let name = path.file_name().map_or_else(|| "upload".to_owned(), |n| n.to_string_lossy().into_owned());
    Ok(Upload::from_name(name, bytes))
}

/// A post with its image and avatar links made absolute.
fn post_json(api: &ApiClient, post: &Post) -> Result<Value, CliError> {
    let mut value = serde_json::to_value(post)?;
    let config = api.config();
    if let Some(image) = &post.image {
        value["image"] = Value::String(config.media_url(image, MediaKind::Post));
    }
    if let Some(avatar) = &post.user_avatar {
        value["user_avatar"] = Value::String(config.media_url(avatar, MediaKind::Profile));
    }
    Ok(value)
}

fn print_json(value: &impl Serialize) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
