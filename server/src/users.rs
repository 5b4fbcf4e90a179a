use hashbrown::HashMap;
use serde_derive::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;
use verse::{AvatarId, UserId};

/// One record of the user database file.
#[derive(Serialize, Deserialize, Clone)]
pub struct UserInfo {
    pub password: String,
    pub user_id: UserId,
    #[serde(default)]
    pub real_name: String,
}

/// The user database: a JSON map of username to record, reloadable on
/// SIGUSR1 without touching live sessions. Avatar ids are handed out per
/// successful login.
pub struct UserDb {
    users: RwLock<HashMap<String, UserInfo>>,
    next_avatar: AtomicU32,
}

impl UserDb {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<UserDb, std::io::Error> {
        let users = Self::parse(path)?;

        Ok(UserDb {
            users: RwLock::new(users),
            next_avatar: AtomicU32::new(1),
        })
    }

    /// Replaces the record set from disk; existing sessions keep their
    /// identities.
    pub fn reload<P: AsRef<Path>>(&self, path: P) -> Result<usize, std::io::Error> {
        let users = Self::parse(path)?;
        let count = users.len();

        *self.users.write().expect("User database poisoned") = users;

        Ok(count)
    }

    fn parse<P: AsRef<Path>>(path: P) -> Result<HashMap<String, UserInfo>, std::io::Error> {
        let file = fs::File::open(path)?;
        serde_json::from_reader(file).map_err(Into::into)
    }

    pub fn len(&self) -> usize {
        self.users.read().expect("User database poisoned").len()
    }

    /// Checks a password; a match yields the user id and a fresh avatar
    /// id.
    pub fn check(&self, username: &str, password: &str) -> Option<(UserId, AvatarId)> {
        let users = self.users.read().expect("User database poisoned");
        let record = users.get(username)?;

        if record.password != password {
            return None;
        }

        Some((record.user_id, self.next_avatar.fetch_add(1, Ordering::SeqCst)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn db_file(content: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("verse-users-test-{}.json", std::process::id()));

        let mut file = fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();

        path
    }

    const USERS: &str = r#"
{
    "singer": { "password": "verse4ever", "user_id": 1001, "real_name": "A. Singer" },
    "drummer": { "password": "offbeat", "user_id": 1002 }
}
"#;

    #[test]
    fn test_load_and_check() {
        let path = db_file(USERS);
        let db = UserDb::load(&path).unwrap();

        assert_eq!(db.len(), 2);

        let (user_id, first_avatar) = db.check("singer", "verse4ever").unwrap();
        assert_eq!(user_id, 1001);

        let (_, second_avatar) = db.check("drummer", "offbeat").unwrap();
        assert_ne!(first_avatar, second_avatar);

        assert!(db.check("singer", "wrong").is_none());
        assert!(db.check("ghost", "verse4ever").is_none());

        fs::remove_file(path).unwrap();
    }
}
