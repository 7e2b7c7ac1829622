use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use barrio_core::{GeoPoint, NewUser, Service, ServiceDraft, ServiceId};
use barrio_engine::{average_ratings, ClientConfig, Marketplace, SearchQuery};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "barrio")]
#[command(about = "Browse and publish neighbourhood services")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Search services, nearest first when a location is known.
    Search {
        #[arg(default_value = "")]
        term: String,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        radius_km: Option<f64>,
        #[arg(long, requires = "lng", allow_hyphen_values = true)]
        lat: Option<f64>,
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lng: Option<f64>,
    },
    /// Print the category taxonomy.
    Categories {
        /// Build it from the backend's category list instead of the configured one.
        #[arg(long)]
        remote: bool,
    },
    Show {
        id: i64,
    },
    Reviews {
        id: i64,
    },
    Login {
        email: String,
        #[arg(long, env = "BARRIO_PASSWORD", hide_env_values = true)]
        password: String,
    },
    Register {
        email: String,
        #[arg(long)]
        full_name: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long, env = "BARRIO_PASSWORD", hide_env_values = true)]
        password: String,
    },
    Logout,
    Whoami,
    /// List the services you published.
    Mine,
    /// Publish a service from a JSON draft file.
    Publish {
        draft: PathBuf,
    },
    Delete {
        id: i64,
    },
    Rate {
        id: i64,
        rating: f64,
    },
    /// List the reviews you wrote.
    MyReviews,
    EditReview {
        review_id: i64,
        rating: f64,
    },
    DeleteReview {
        review_id: i64,
    },
    Geocode {
        #[arg(allow_hyphen_values = true)]
        lat: f64,
        #[arg(allow_hyphen_values = true)]
        lng: f64,
    },
    /// Serve the local JSON API.
    Serve,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,barrio_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_services(services: &[Service]) {
    if services.is_empty() {
        println!("no services found");
        return;
    }
    for s in services {
        let distance = s
            .distance_km
            .map(|d| format!("{d:.1} km"))
            .unwrap_or_else(|| "-".to_string());
        let price = s
            .price
            .map(|p| format!("{p:.0} {}", s.price_modality.as_str()))
            .unwrap_or_else(|| s.price_modality.as_str().to_string());
        println!(
            "{:>6}  {:<40}  {:<28}  {:>9}  {}",
            s.id, s.service_name, s.category, distance, price
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = ClientConfig::from_env();

    tracing::debug!(api = %config.api_base_url, "using backend");
    let market = Marketplace::from_config(&config).await?;

    match cli.command {
        Commands::Search {
            term,
            category,
            radius_km,
            lat,
            lng,
        } => {
            let query = SearchQuery {
                term,
                category,
                radius_km,
                reference: lat.zip(lng).map(|(lat, lng)| GeoPoint::new(lat, lng)),
                skip_refresh: false,
            };
            let results = market.search(query).await?;
            print_services(&results.services);
        }
        Commands::Categories { remote } => {
            if remote && !market.refresh_taxonomy().await {
                eprintln!("backend categories unavailable; showing the configured taxonomy");
            }
            for group in market.search_engine().taxonomy().await.groups {
                println!("{}", group.name);
                for leaf in group.leaves {
                    println!("  {leaf}");
                }
            }
        }
        Commands::Show { id } => {
            let service = market.service(ServiceId(id)).await?;
            println!("{} ({})", service.service_name, service.category);
            println!("{}", service.description);
            println!("address: {}", service.address);
            if let Some(schedule) = &service.schedule {
                println!("schedule: {schedule}");
            }
            println!(
                "rating: {:.1} ({} reviews)",
                service.rating, service.total_reviews
            );
            println!("{}", service.contact_method.public_label());
            if let Some(url) = service.contact_method.whatsapp_url(None) {
                println!("whatsapp: {url}");
            }
        }
        Commands::Reviews { id } => {
            let outcome = market.reviews(ServiceId(id)).await;
            if outcome.is_degraded() {
                eprintln!("reviews could not be loaded");
            }
            let reviews = outcome.into_value();
            match average_ratings(&reviews).get(&ServiceId(id)) {
                Some(avg) => println!("{} reviews, average {avg:.1}", reviews.len()),
                None => println!("no reviews yet"),
            }
            for review in reviews {
                println!("  #{} by user {}: {}", review.id, review.reviewer_user_id, review.rating);
            }
        }
        Commands::Login { email, password } => {
            let user = market.session().login(&email, &password).await?;
            println!("logged in as {} <{}>", user.full_name, user.email);
        }
        Commands::Register {
            email,
            full_name,
            phone,
            password,
        } => {
            let user = market
                .session()
                .register(&NewUser {
                    email,
                    password,
                    full_name,
                    phone,
                })
                .await?;
            println!("registered and logged in as {}", user.full_name);
        }
        Commands::Logout => {
            market.session().logout().await;
            println!("logged out");
        }
        Commands::Whoami => match market.session().current_user(true).await {
            Some(user) => println!("{} <{}> (id {})", user.full_name, user.email, user.id),
            None => println!("not logged in"),
        },
        Commands::Mine => print_services(&market.my_services().await?),
        Commands::Publish { draft } => {
            let text = std::fs::read_to_string(&draft)
                .with_context(|| format!("reading {}", draft.display()))?;
            let draft: ServiceDraft =
                serde_json::from_str(&text).context("parsing service draft")?;
            let service = market.publish(&draft).await?;
            println!("published service {}", service.id);
        }
        Commands::Delete { id } => {
            if market.delete(ServiceId(id)).await? {
                println!("deleted service {id}");
            } else {
                println!("service {id} was already gone");
            }
        }
        Commands::Rate { id, rating } => {
            let review = market.rate(ServiceId(id), rating).await?;
            println!("review {} saved", review.id);
        }
        Commands::MyReviews => {
            let reviews = market.my_reviews().await?;
            if reviews.is_empty() {
                println!("no reviews yet");
            }
            for review in reviews {
                println!(
                    "  #{} on service {}: {}",
                    review.id, review.service_id, review.rating
                );
            }
        }
        Commands::EditReview { review_id, rating } => {
            let review = market.update_review(review_id, rating).await?;
            println!(
                "review {} now rates service {} {}",
                review.id, review.service_id, review.rating
            );
        }
        Commands::DeleteReview { review_id } => {
            if market.delete_review(review_id).await? {
                println!("deleted review {review_id}");
            } else {
                println!("review {review_id} was already gone");
            }
        }
        Commands::Geocode { lat, lng } => {
            let point = GeoPoint::new(lat, lng);
            if !point.is_in_range() {
                bail!("coordinates out of range: {lat}, {lng}");
            }
            println!("{}", market.reverse_geocode(point).await);
        }
        Commands::Serve => barrio_web::serve(&config, market).await?,
    }

    Ok(())
}
