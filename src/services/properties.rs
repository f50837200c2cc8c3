use std::sync::Arc;

use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{new_public_id, NewProperty, NewSubUnit, Property, SubUnit},
    repository::Store,
    schemas::{CreatePropertyInput, CreateSubUnitInput},
};

#[derive(Clone)]
pub struct PropertyService {
    store: Arc<dyn Store>,
}

impl PropertyService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn create_property(&self, input: CreatePropertyInput) -> AppResult<Property> {
        let property = self
            .store
            .insert_property(NewProperty {
                public_id: new_public_id(),
                name: input.name.trim().to_string(),
                address: input.address.trim().to_string(),
                city: input.city.trim().to_string(),
                province: input.province.trim().to_string(),
                tourism_license: input.tourism_license.trim().to_uppercase(),
                capacity: input.capacity,
            })
            .await?;
        tracing::info!(property_id = %property.public_id, "Property created");
        Ok(property)
    }

    pub async fn get_property(&self, public_id: Uuid) -> AppResult<Property> {
        self.store
            .get_property_by_public_id(public_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Property not found.".to_string()))
    }

    pub async fn list_properties(&self, limit: i64, offset: i64) -> AppResult<Vec<Property>> {
        self.store.list_properties(limit, offset).await
    }

    pub async fn create_sub_unit(
        &self,
        property_id: Uuid,
        input: CreateSubUnitInput,
    ) -> AppResult<SubUnit> {
        let property = self.get_property(property_id).await?;
        if let Some(capacity) = input.capacity {
            if capacity > property.capacity {
                return Err(AppError::UnprocessableEntity(
                    "Sub-unit capacity exceeds property capacity.".to_string(),
                ));
            }
        }
        self.store
            .insert_sub_unit(NewSubUnit {
                public_id: new_public_id(),
                property_id: property.id,
                name: input.name.trim().to_string(),
                capacity: input.capacity,
            })
            .await
    }

    pub async fn list_sub_units(&self, property_id: Uuid) -> AppResult<Vec<SubUnit>> {
        let property = self.get_property(property_id).await?;
        self.store.list_sub_units(property.id).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::PropertyService;
    use crate::{
        repository::MemoryStore,
        schemas::{CreatePropertyInput, CreateSubUnitInput},
    };

    fn input(license: &str) -> CreatePropertyInput {
        CreatePropertyInput {
            name: "Casa Patio".to_string(),
            address: "Calle Feria 8".to_string(),
            city: "Sevilla".to_string(),
            province: "Sevilla".to_string(),
            tourism_license: license.to_string(),
            capacity: 4,
        }
    }

    #[tokio::test]
    async fn license_is_normalized_and_unique() {
        let service = PropertyService::new(Arc::new(MemoryStore::new()));
        let created = service
            .create_property(input(" vft/se/777 "))
            .await
            .expect("create");
        assert_eq!(created.tourism_license, "VFT/SE/777");

        let error = service
            .create_property(input("VFT/SE/777"))
            .await
            .expect_err("duplicate");
        assert!(error.is_conflict());
    }

    #[tokio::test]
    async fn sub_units_belong_to_their_property() {
        let service = PropertyService::new(Arc::new(MemoryStore::new()));
        let property = service
            .create_property(input("VFT/SE/778"))
            .await
            .expect("create");
        service
            .create_sub_unit(
                property.public_id,
                CreateSubUnitInput {
                    name: "Estudio A".to_string(),
                    capacity: Some(2),
                },
            )
            .await
            .expect("sub-unit");
        let too_big = service
            .create_sub_unit(
                property.public_id,
                CreateSubUnitInput {
                    name: "Loft".to_string(),
                    capacity: Some(9),
                },
            )
            .await;
        assert!(too_big.is_err());

        let units = service
            .list_sub_units(property.public_id)
            .await
            .expect("list");
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].name, "Estudio A");
    }
}
