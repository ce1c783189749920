mod handshake_tests;
