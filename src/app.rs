use axum::extract::FromRef;

use crate::{
    api::v1::{auth::UserCollection, ride::RideCollection, token::JwtState},
    migrate::MigrationCollection,
};

#[derive(FromRef, Clone)]
pub struct AppState {
    pub argon: argon2::Argon2<'static>,
    pub jwt_state: JwtState,

    pub mongo_client: mongodb::Client,
    pub database: mongodb::Database,
    pub user_collection: UserCollection,
    pub ride_collection: RideCollection,
    pub migrate_collection: MigrationCollection,
}

impl AppState {
    pub async fn new(
        mongo_url: &str,
        database_name: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let argon = argon2::Argon2::default();
        let jwt_state = JwtState::new_from_env();

        let mongo_client_opt = mongodb::options::ClientOptions::parse(mongo_url).await?;
        let mongo_client = mongodb::Client::with_options(mongo_client_opt)?;

        let db = mongo_client.database(database_name);
        Ok(Self {
            argon,
            jwt_state,

            mongo_client,
            user_collection: UserCollection(db.collection("users").into()),
            ride_collection: RideCollection(db.collection("rides").into()),
            migrate_collection: MigrationCollection(db.collection("migrations").into()),
            database: db,
        })
    }

    pub async fn new_from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let mongodb_url = &std::env::var("MONGODB_URI")
            .expect("Cannot retreive MONGODB_URI from environment variable.");

        Self::new(mongodb_url, "rideshare").await
    }
}
