use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split a `proto!address!port` listen string.
pub fn parse_proto(arg: &str) -> Option<(&str, &str, &str)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next()?);

    Some((proto, addr, port))
}

#[test]
fn parse_proto_test() {
    assert_eq!(
        parse_proto("tcp!0.0.0.0!564"),
        Some(("tcp", "0.0.0.0", "564"))
    );
    assert_eq!(
        parse_proto("unix!/tmp/9p.sock!0"),
        Some(("unix", "/tmp/9p.sock", "0"))
    );
    assert_eq!(parse_proto("/dev/vport0p1"), None);
}
