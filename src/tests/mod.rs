mod mixer_selftest;
