use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use fitmusic_api::biometrics::{plain, BiometricSnapshot};
use fitmusic_api::fitbit::{FetchError, FitbitClient, Resource, RetryPolicy, FITBIT_API_BASE};
use fitmusic_api::oauth::{self, Credentials, TokenFile, TokenLookup, TOKEN_URL};

#[derive(Parser)]
#[command(name = "poll_biometrics")]
#[command(about = "print the latest Fitbit readings for a day", long_about = None)]
struct Cli {
    #[arg(long, env = "CLIENT_ID")]
    client_id: String,

    #[arg(long, env = "CLIENT_SECRET", hide_env_values = true)]
    client_secret: String,

    #[arg(long, env = "REDIRECT_URI", default_value = "")]
    redirect_uri: String,

    /// Token file written by the web service's /callback
    #[arg(long, env = "TOKEN_PATH", default_value = "fitbit_token.json")]
    token_path: String,

    /// Day to read, defaults to today
    #[arg(short, long)]
    date: Option<NaiveDate>,

    #[arg(long, env = "FITBIT_API_BASE", default_value = FITBIT_API_BASE)]
    api_base: String,

    #[arg(long, env = "FITBIT_TOKEN_URL", default_value = TOKEN_URL)]
    token_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter("poll_biometrics=info,fitmusic_api=info")
        .init();

    let cli = Cli::parse();
    let date = cli.date.unwrap_or_else(|| chrono::Local::now().date_naive());
    let http = reqwest::Client::new();
    let token_file = TokenFile::new(&cli.token_path);

    let TokenLookup::Present(token) = token_file.load().await? else {
        bail!(
            "no token at {}; authorize through the web service first",
            cli.token_path
        );
    };

    let mut client = FitbitClient::new(http.clone(), &cli.api_base, &token.access_token)
        .with_retry(RetryPolicy::rate_limited());

    let mut steps = client.latest(Resource::Steps, date).await;

    // one refresh attempt if the stored access token has expired
    if matches!(&steps, Err(e) if e.is_unauthorized()) {
        tracing::info!("access token rejected, refreshing");
        let credentials = Credentials {
            client_id: cli.client_id.clone(),
            client_secret: cli.client_secret.clone(),
            redirect_uri: cli.redirect_uri.clone(),
        };
        let refreshed = oauth::refresh_access_token(
            &http,
            &cli.token_url,
            &credentials,
            &token.refresh_token,
        )
        .await
        .context("failed to refresh access token")?;
        token_file.save(&refreshed).await?;
        client = FitbitClient::new(http.clone(), &cli.api_base, &refreshed.access_token)
            .with_retry(RetryPolicy::rate_limited());
        steps = client.latest(Resource::Steps, date).await;
    }
    let mut steps = Some(steps);

    println!("\nreadings for {}\n", date);

    let mut snapshot = BiometricSnapshot::empty(date.format("%Y-%m-%d").to_string());
    for resource in Resource::ALL {
        let cached = if resource == Resource::Steps {
            steps.take()
        } else {
            None
        };
        let result = match cached {
            Some(result) => result,
            None => client.latest(resource, date).await,
        };
        let value = match result {
            Ok(Some(point)) => {
                snapshot.time = Some(point.time.clone());
                Some(point.value)
            }
            Ok(None) => None,
            Err(FetchError::RateLimited(attempts)) => {
                tracing::warn!("{}: gave up after {} attempts", resource.label(), attempts);
                None
            }
            Err(e) => {
                tracing::warn!("{}: {}", resource.label(), e);
                None
            }
        };

        if let Some(value) = &value {
            match resource {
                Resource::Steps => snapshot.steps = value.clone(),
                Resource::Calories => snapshot.calories = value.clone(),
                Resource::HeartRate => snapshot.bpm = value.clone(),
                Resource::MinutesSedentary => snapshot.sedentary = value.clone(),
                _ => {}
            }
        }

        let shown = value.as_ref().map(plain).unwrap_or_else(|| "-".to_string());
        println!("   {:<22} {}", resource.label(), shown);
    }
    println!(
        "   last sample at         {}\n",
        snapshot.time.as_deref().unwrap_or("--:--")
    );

    println!("sleep:");
    match client.sleep_summary(date).await {
        Ok(Some(sleep)) => {
            println!("   asleep     {} min", sleep.asleep);
            println!("   efficiency {}%", sleep.eff);
            println!("   deep       {} min", sleep.deep);
            println!("   rem        {} min", sleep.rem);
            println!("   light      {} min", sleep.light);
            println!("   wake       {} min", sleep.wake);
            snapshot.sleep = Some(sleep);
        }
        Ok(None) => println!("   (no sleep logged)"),
        Err(e) => println!("   (unavailable: {})", e),
    }

    println!("\ncompact: {}\n", snapshot.compact());
    Ok(())
}
