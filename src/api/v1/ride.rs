use axum::{extract::State, Json};
use bson::oid::ObjectId;
use mongodb::options::{FindOneAndUpdateOptions, ReturnDocument};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use validator::Validate;

use crate::{
    error::Error,
    mongo_ext::Collection,
    util::{FormattedDateTime, ObjectIdString, PathObjectId},
};

use super::auth::{UserAccess, UserModel, UserRole};

#[derive(Clone)]
pub struct RideCollection(pub Collection<Ride>);

impl std::ops::Deref for RideCollection {
    type Target = Collection<Ride>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Ride {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub rider_id: ObjectId,
    pub driver_id: Option<ObjectId>,
    pub pickup_location: String,
    pub drop_location: String,
    pub status: RideStatus,

    pub created_at: bson::DateTime,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideStatus {
    Requested,
    Accepted,
    Completed,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RideModel {
    pub id: ObjectIdString,
    pub rider_id: ObjectIdString,
    pub driver_id: Option<ObjectIdString>,
    pub pickup_location: String,
    pub drop_location: String,
    pub status: RideStatus,

    pub created_at: FormattedDateTime,
}

impl From<Ride> for RideModel {
    fn from(value: Ride) -> Self {
        Self {
            id: value.id.into(),
            rider_id: value.rider_id.into(),
            driver_id: value.driver_id.map(Into::into),
            pickup_location: value.pickup_location,
            drop_location: value.drop_location,
            status: value.status,

            created_at: value.created_at.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RideIndexResponse {
    rides: Vec<RideModel>,
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
pub struct CreateRideRequest {
    #[validate(length(min = 1, max = 256))]
    pub pickup_location: String,

    #[validate(length(min = 1, max = 256))]
    pub drop_location: String,
}

pub async fn create(
    State(rides): State<RideCollection>,
    user: UserModel,
    Json(request): Json<CreateRideRequest>,
) -> Result<Json<RideModel>, Error> {
    request.validate()?;

    match user.role {
        UserRole::Driver => return Err(Error::Forbidden),
        UserRole::Rider => {}
    }

    let ride = Ride {
        id: ObjectId::new(),
        rider_id: user.id,
        driver_id: None,
        pickup_location: request.pickup_location,
        drop_location: request.drop_location,
        status: RideStatus::Requested,

        created_at: OffsetDateTime::now_utc().into(),
    };

    rides.insert_one(&ride, None).await?;

    Ok(Json(ride.into()))
}

pub async fn index_requests(
    State(rides): State<RideCollection>,
    user: UserAccess,
) -> Result<Json<RideIndexResponse>, Error> {
    match user.role {
        UserRole::Rider => return Err(Error::Forbidden),
        UserRole::Driver => {}
    }

    let mut cursor = rides
        .find(
            bson::doc! {
                "status": bson::to_bson(&RideStatus::Requested)?
            },
            None,
        )
        .await?;

    let mut result = vec![];

    while cursor.advance().await? {
        result.push(cursor.deserialize_current()?.into());
    }

    Ok(Json(RideIndexResponse { rides: result }))
}

pub async fn accept(
    State(rides): State<RideCollection>,
    user: UserModel,
    PathObjectId(ride_id): PathObjectId,
) -> Result<Json<RideModel>, Error> {
    match user.role {
        UserRole::Rider => return Err(Error::Forbidden),
        UserRole::Driver => {}
    }

    // The status filter is the serialization point: of two concurrent
    // accepts, only one matches a REQUESTED document.
    let updated = rides
        .find_one_and_update(
            bson::doc! {
                "_id": ride_id,
                "status": bson::to_bson(&RideStatus::Requested)?,
            },
            bson::doc! {
                "$set": {
                    "driver_id": user.id,
                    "status": bson::to_bson(&RideStatus::Accepted)?,
                }
            },
            FindOneAndUpdateOptions::builder()
                .return_document(ReturnDocument::After)
                .build(),
        )
        .await?;

    match updated {
        Some(ride) => Ok(Json(ride.into())),
        None => match rides.find_one_by_id(ride_id).await? {
            Some(_) => Err(Error::InvalidTransition),
            None => Err(Error::NoResource),
        },
    }
}

pub async fn complete(
    State(rides): State<RideCollection>,
    user: UserModel,
    PathObjectId(ride_id): PathObjectId,
) -> Result<Json<RideModel>, Error> {
    let ride = rides
        .find_one_by_id(ride_id)
        .await?
        .ok_or(Error::NoResource)?;

    match ride.status {
        RideStatus::Accepted => {}
        RideStatus::Requested | RideStatus::Completed => return Err(Error::InvalidTransition),
    }

    let is_rider = ride.rider_id == user.id;
    let is_driver = ride.driver_id == Some(user.id);

    if !is_rider && !is_driver {
        return Err(Error::Forbidden);
    }

    // Conditional on the status read above still holding; a lost race to
    // another completer surfaces as a failed transition.
    let updated = rides
        .find_one_and_update(
            bson::doc! {
                "_id": ride_id,
                "status": bson::to_bson(&RideStatus::Accepted)?,
            },
            bson::doc! {
                "$set": {
                    "status": bson::to_bson(&RideStatus::Completed)?,
                }
            },
            FindOneAndUpdateOptions::builder()
                .return_document(ReturnDocument::After)
                .build(),
        )
        .await?
        .ok_or(Error::InvalidTransition)?;

    Ok(Json(updated.into()))
}

pub async fn index(
    State(rides): State<RideCollection>,
    user: UserModel,
) -> Result<Json<RideIndexResponse>, Error> {
    match user.role {
        UserRole::Driver => return Err(Error::Forbidden),
        UserRole::Rider => {}
    }

    let mut cursor = rides
        .find(
            bson::doc! {
                "rider_id": user.id
            },
            None,
        )
        .await?;

    let mut result = vec![];

    while cursor.advance().await? {
        result.push(cursor.deserialize_current()?.into());
    }

    Ok(Json(RideIndexResponse { rides: result }))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::Json;
    use bson::oid::ObjectId;

    use crate::{
        api::v1::tests::{bootstrap, Bootstrap},
        error::Error,
        util::PathObjectId,
    };

    use super::{RideModel, RideStatus, UserRole};

    async fn request_ride(bootstrap: &Bootstrap, pickup: &str, drop: &str) -> RideModel {
        let Json(ride) = super::create(
            bootstrap.ride_collection(),
            bootstrap.user_model.clone(),
            Json(super::CreateRideRequest {
                pickup_location: pickup.to_string(),
                drop_location: drop.to_string(),
            }),
        )
        .await
        .unwrap();

        ride
    }

    #[tokio::test]
    async fn test_create_ride() {
        let bootstrap = bootstrap().await;

        let ride = request_ride(&bootstrap, "A", "B").await;

        assert_eq!(ride.status, RideStatus::Requested);
        assert!(ride.driver_id.is_none());
        assert_eq!(ride.rider_id, bootstrap.user_id());
        assert_eq!(ride.pickup_location, "A");
        assert_eq!(ride.drop_location, "B");
    }

    #[tokio::test]
    async fn test_create_ride_requires_rider() {
        let bootstrap = bootstrap().await;
        let driver = bootstrap.derive("bob", "password", UserRole::Driver).await;

        let err = super::create(
            bootstrap.ride_collection(),
            driver.user_model.clone(),
            Json(super::CreateRideRequest {
                pickup_location: "A".to_string(),
                drop_location: "B".to_string(),
            }),
        )
        .await
        .unwrap_err();

        assert_matches!(err, Error::Forbidden);
    }

    #[tokio::test]
    async fn test_accept_ride() {
        let bootstrap = bootstrap().await;
        let driver = bootstrap.derive("bob", "password", UserRole::Driver).await;

        let ride = request_ride(&bootstrap, "A", "B").await;

        let Json(accepted) = super::accept(
            bootstrap.ride_collection(),
            driver.user_model.clone(),
            PathObjectId(*ride.id),
        )
        .await
        .unwrap();

        assert_eq!(accepted.status, RideStatus::Accepted);
        assert_eq!(accepted.driver_id.unwrap(), driver.user_id());

        // acceptance is exclusive; the ride is no longer REQUESTED
        let other = bootstrap
            .derive("charlie", "password", UserRole::Driver)
            .await;

        let err = super::accept(
            bootstrap.ride_collection(),
            other.user_model.clone(),
            PathObjectId(*ride.id),
        )
        .await
        .unwrap_err();

        assert_matches!(err, Error::InvalidTransition);
    }

    #[tokio::test]
    async fn test_accept_ride_requires_driver() {
        let bootstrap = bootstrap().await;

        let ride = request_ride(&bootstrap, "A", "B").await;

        let err = super::accept(
            bootstrap.ride_collection(),
            bootstrap.user_model.clone(),
            PathObjectId(*ride.id),
        )
        .await
        .unwrap_err();

        assert_matches!(err, Error::Forbidden);
    }

    #[tokio::test]
    async fn test_accept_unknown_ride() {
        let bootstrap = bootstrap().await;
        let driver = bootstrap.derive("bob", "password", UserRole::Driver).await;

        let err = super::accept(
            bootstrap.ride_collection(),
            driver.user_model.clone(),
            PathObjectId(ObjectId::new()),
        )
        .await
        .unwrap_err();

        assert_matches!(err, Error::NoResource);
    }

    #[tokio::test]
    async fn test_complete_requires_accepted() {
        let bootstrap = bootstrap().await;

        let ride = request_ride(&bootstrap, "A", "B").await;

        let err = super::complete(
            bootstrap.ride_collection(),
            bootstrap.user_model.clone(),
            PathObjectId(*ride.id),
        )
        .await
        .unwrap_err();

        assert_matches!(err, Error::InvalidTransition);
    }

    #[tokio::test]
    async fn test_complete_requires_party() {
        let bootstrap = bootstrap().await;
        let driver = bootstrap.derive("bob", "password", UserRole::Driver).await;
        let stranger = bootstrap.derive("mallory", "password", UserRole::Rider).await;

        let ride = request_ride(&bootstrap, "A", "B").await;

        let _ = super::accept(
            bootstrap.ride_collection(),
            driver.user_model.clone(),
            PathObjectId(*ride.id),
        )
        .await
        .unwrap();

        let err = super::complete(
            bootstrap.ride_collection(),
            stranger.user_model.clone(),
            PathObjectId(*ride.id),
        )
        .await
        .unwrap_err();

        assert_matches!(err, Error::Forbidden);
    }

    #[tokio::test]
    async fn test_ride_lifecycle() {
        let bootstrap = bootstrap().await;
        let driver = bootstrap.derive("bob", "password", UserRole::Driver).await;

        let ride = request_ride(&bootstrap, "A", "B").await;
        assert_eq!(ride.status, RideStatus::Requested);
        assert!(ride.driver_id.is_none());

        let Json(requests) =
            super::index_requests(bootstrap.ride_collection(), driver.user_access())
                .await
                .unwrap();
        assert!(requests.rides.iter().any(|it| it.id == *ride.id));

        let Json(accepted) = super::accept(
            bootstrap.ride_collection(),
            driver.user_model.clone(),
            PathObjectId(*ride.id),
        )
        .await
        .unwrap();
        assert_eq!(accepted.status, RideStatus::Accepted);
        assert_eq!(accepted.driver_id.unwrap(), driver.user_id());

        let Json(completed) = super::complete(
            bootstrap.ride_collection(),
            bootstrap.user_model.clone(),
            PathObjectId(*ride.id),
        )
        .await
        .unwrap();
        assert_eq!(completed.status, RideStatus::Completed);

        let err = super::complete(
            bootstrap.ride_collection(),
            driver.user_model.clone(),
            PathObjectId(*ride.id),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::InvalidTransition);

        let Json(mine) = super::index(bootstrap.ride_collection(), bootstrap.user_model.clone())
            .await
            .unwrap();
        assert_eq!(mine.rides.len(), 1);
        assert_eq!(mine.rides[0].id, *ride.id);
        assert_eq!(mine.rides[0].status, RideStatus::Completed);
    }

    #[tokio::test]
    async fn test_index_scoped_to_rider() {
        let bootstrap = bootstrap().await;
        let other = bootstrap.derive("dora", "password", UserRole::Rider).await;
        let driver = bootstrap.derive("bob", "password", UserRole::Driver).await;

        let _ = request_ride(&bootstrap, "A", "B").await;
        let _ = request_ride(&other, "C", "D").await;

        let Json(mine) = super::index(bootstrap.ride_collection(), bootstrap.user_model.clone())
            .await
            .unwrap();
        assert_eq!(mine.rides.len(), 1);
        assert_eq!(mine.rides[0].rider_id, bootstrap.user_id());

        let err = super::index(bootstrap.ride_collection(), driver.user_model.clone())
            .await
            .unwrap_err();
        assert_matches!(err, Error::Forbidden);
    }

    #[tokio::test]
    async fn test_index_requests_requires_driver() {
        let bootstrap = bootstrap().await;

        let err = super::index_requests(bootstrap.ride_collection(), bootstrap.user_access())
            .await
            .unwrap_err();

        assert_matches!(err, Error::Forbidden);
    }
}
