use validator::Validate;

/// Password-login input. Shape checks only; nothing here touches the store.
#[derive(Validate)]
pub struct PasswordLoginInput {
    #[validate(email, length(max = 254))]
    pub email: String,
    #[validate(length(min = 1, max = 1024))]
    pub password: String,
}

impl PasswordLoginInput {
    pub fn new(email: &str, password: &str) -> Self {
        Self {
            email: email.trim().to_string(),
            password: password.to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}
