use rand::rngs::OsRng;
use rand::Rng;

/// Length of handshake cookies, octets.
pub const COOKIE_SIZE: usize = 16;

/// Printable ASCII range used for cookie octets.
const PRINTABLE_LOW: u8 = b'!';
const PRINTABLE_HIGH: u8 = b'~';

/// Generates a fresh handshake cookie: COOKIE_SIZE printable octets drawn
/// from the operating system CSPRNG. 94 symbols over 16 positions give
/// roughly 104 bits of entropy.
pub fn new_cookie() -> String {
    let mut rng = OsRng;
    let cookie: Vec<u8> = (0..COOKIE_SIZE)
        .map(|_| rng.gen_range(PRINTABLE_LOW..=PRINTABLE_HIGH))
        .collect();

    String::from_utf8(cookie).expect("Printable range is valid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_size_and_charset() {
        let cookie = new_cookie();

        assert_eq!(cookie.len(), COOKIE_SIZE);
        assert!(cookie
            .bytes()
            .all(|byte| byte >= PRINTABLE_LOW && byte <= PRINTABLE_HIGH));
    }

    #[test]
    fn test_cookies_differ() {
        assert_ne!(new_cookie(), new_cookie());
    }
}
