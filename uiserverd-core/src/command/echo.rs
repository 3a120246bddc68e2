//! The ECHO test command.

use async_trait::async_trait;

use crate::assuan::Request;
use crate::error::{codes, CommandError, CommandResult};
use crate::server::Connection;

use super::CommandHandler;

/// Echoes its arguments back as data. With --inquire=KEYWORD the
/// client is asked for data under that keyword first and gets it
/// mirrored back.
pub struct EchoCommand;

#[async_trait]
impl CommandHandler for EchoCommand {
    fn name(&self) -> &'static str {
        "ECHO"
    }

    async fn run(&self, conn: &mut Connection, request: &Request) -> CommandResult<()> {
        let text = request.positional_joined();
        if !text.is_empty() {
            conn.send_data(text.as_bytes()).await?;
        }
        if request.has_option("inquire") {
            let Some(keyword) = request.option_value("inquire") else {
                return Err(CommandError::new(
                    codes::INV_ARG,
                    "ECHO --inquire requires a keyword",
                ));
            };
            match conn.inquire(keyword).await? {
                Some(data) => {
                    if !data.is_empty() {
                        conn.send_data(&data).await?;
                    }
                }
                None => {
                    return Err(CommandError::new(
                        codes::ASS_CANCELED,
                        "inquire canceled by client",
                    ))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{NullCertificateResolver, NullEngine};
    use crate::server::{test_connection, test_services};
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn echoes_its_arguments_as_data() {
        let services = test_services(Arc::new(NullEngine), Arc::new(NullCertificateResolver));
        let (mut conn, theirs) = test_connection(services);
        let request = Request::parse("ECHO hello world").unwrap();

        EchoCommand.run(&mut conn, &request).await.unwrap();

        let mut client = BufReader::new(theirs);
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim_end(), "D hello world");
    }

    #[tokio::test]
    async fn inquire_round_trips_client_data() {
        let services = test_services(Arc::new(NullEngine), Arc::new(NullCertificateResolver));
        let (mut conn, theirs) = test_connection(services);
        let request = Request::parse("ECHO --inquire=PING").unwrap();

        let client_side = tokio::spawn(async move {
            let mut client = BufReader::new(theirs);
            let mut line = String::new();
            client.read_line(&mut line).await.unwrap();
            assert_eq!(line.trim_end(), "INQUIRE PING");
            client.get_mut().write_all(b"D ping\nEND\n").await.unwrap();
            line.clear();
            client.read_line(&mut line).await.unwrap();
            assert_eq!(line.trim_end(), "D ping");
        });

        EchoCommand.run(&mut conn, &request).await.unwrap();
        client_side.await.unwrap();
    }

    #[tokio::test]
    async fn bare_inquire_option_is_rejected() {
        let services = test_services(Arc::new(NullEngine), Arc::new(NullCertificateResolver));
        let (mut conn, _theirs) = test_connection(services);
        let request = Request::parse("ECHO --inquire").unwrap();

        let err = EchoCommand.run(&mut conn, &request).await.unwrap_err();
        assert_eq!(err.code, codes::INV_ARG);
    }

    #[tokio::test]
    async fn canceled_inquire_fails_the_command() {
        let services = test_services(Arc::new(NullEngine), Arc::new(NullCertificateResolver));
        let (mut conn, theirs) = test_connection(services);
        let request = Request::parse("ECHO --inquire=PING").unwrap();

        let client_side = tokio::spawn(async move {
            let mut client = BufReader::new(theirs);
            let mut line = String::new();
            client.read_line(&mut line).await.unwrap();
            client.get_mut().write_all(b"CAN\n").await.unwrap();
            client
        });

        let err = EchoCommand.run(&mut conn, &request).await.unwrap_err();
        assert_eq!(err.code, codes::ASS_CANCELED);
        drop(client_side.await.unwrap());
    }
}
